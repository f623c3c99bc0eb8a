//! Load progress reporting

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Progress notification emitted while a model is loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Fraction complete, in `[0, 1]`
    pub progress: f64,
    /// Seconds since the load started
    pub time_elapsed: f64,
    pub text: String,
}

/// Callback receiving progress reports
pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// Forwards progress to a callback, never letting the fraction go backwards.
///
/// A tracker can be narrowed to a sub-range with [`ProgressTracker::span`] so
/// that loading several models maps each one onto its own slice of `[0, 1]`.
#[derive(Clone)]
pub struct ProgressTracker {
    callback: Option<ProgressCallback>,
    started: Instant,
    high_water: Arc<Mutex<f64>>,
    offset: f64,
    scale: f64,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            started: Instant::now(),
            high_water: Arc::new(Mutex::new(0.0)),
            offset: 0.0,
            scale: 1.0,
        }
    }

    /// A tracker that drops every report
    pub fn silent() -> Self {
        Self::new(None)
    }

    /// Tracker mapping `[0, 1]` onto `[start, end]` of this tracker's range
    pub fn span(&self, start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        let end = end.clamp(start, 1.0);
        Self {
            callback: self.callback.clone(),
            started: self.started,
            high_water: self.high_water.clone(),
            offset: self.offset + start * self.scale,
            scale: (end - start) * self.scale,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Report a fraction of this tracker's range
    pub fn report(&self, fraction: f64, text: impl Into<String>) {
        let Some(callback) = &self.callback else {
            return;
        };
        let local = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        // Delivered under the lock so concurrent reporters cannot reorder
        let mut high_water = match self.high_water.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = (self.offset + local * self.scale).clamp(0.0, 1.0);
        if value > *high_water {
            *high_water = value;
        }
        callback(ProgressReport {
            progress: *high_water,
            time_elapsed: self.elapsed_secs(),
            text: text.into(),
        });
    }
}
