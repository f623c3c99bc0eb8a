//! Accelerator detection
//!
//! Detects the local GPU, the features its kernels can rely on, and checks
//! a model's requirements against them before anything is downloaded.

use std::collections::BTreeSet;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::types::model::ModelRecord;

/// Half-precision shader arithmetic
pub const FEATURE_SHADER_F16: &str = "shader-f16";

/// Accelerator information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub name: String,
    /// Optional features the device supports
    pub features: BTreeSet<String>,
    /// Dedicated (or unified) memory in MB, 0 when unknown
    pub vram_total_mb: u64,
    pub is_available: bool,
}

impl AcceleratorInfo {
    pub fn new(name: impl Into<String>, features: &[&str], vram_total_mb: u64) -> Self {
        Self {
            name: name.into(),
            features: features.iter().map(|f| f.to_string()).collect(),
            vram_total_mb,
            is_available: true,
        }
    }

    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            ..Self::default()
        }
    }
}

/// Check a model's feature and memory requirements.
///
/// Returns the list of unmet requirements on failure.
pub fn check_requirements(record: &ModelRecord, info: &AcceleratorInfo) -> Result<(), Vec<String>> {
    let mut missing: Vec<String> = record
        .required_features
        .iter()
        .filter(|f| !info.features.contains(f.as_str()))
        .cloned()
        .collect();

    // Unknown VRAM is not treated as insufficient
    if let Some(required) = record.vram_required_mb {
        if info.vram_total_mb > 0 && (info.vram_total_mb as f64) < required {
            missing.push(format!(
                "{:.0} MB of accelerator memory ({} MB available)",
                required, info.vram_total_mb
            ));
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

/// Detect available accelerator (best effort)
pub fn detect_gpu() -> AcceleratorInfo {
    if let Some(info) = detect_gpu_nvidia_smi() {
        return info;
    }

    #[cfg(target_os = "macos")]
    if let Some(info) = detect_gpu_system_profiler() {
        return info;
    }

    AcceleratorInfo::not_detected()
}

fn detect_gpu_nvidia_smi() -> Option<AcceleratorInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the first line of `nvidia-smi` CSV output
fn parse_nvidia_smi(stdout: &str) -> Option<AcceleratorInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return None;
    }

    let name = parts[0].to_string();
    let vram_total_mb = parts[1].parse::<u64>().ok()?;

    // Native fp16 arithmetic from compute capability 5.3 on
    let mut features = Vec::new();
    if let Some(cap) = parts.get(2).and_then(|c| c.parse::<f64>().ok()) {
        if cap >= 5.3 {
            features.push(FEATURE_SHADER_F16);
        }
    }

    Some(AcceleratorInfo::new(name, &features, vram_total_mb))
}

/// Detect GPU using system_profiler SPDisplaysDataType
#[cfg(target_os = "macos")]
fn detect_gpu_system_profiler() -> Option<AcceleratorInfo> {
    let output = Command::new("system_profiler")
        .args(["SPDisplaysDataType"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 48 GB"
        if trimmed.contains("VRAM") {
            let after_colon = trimmed.split(':').nth(1).unwrap_or("").trim();
            let parts: Vec<&str> = after_colon.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(val) = parts[0].parse::<u64>() {
                    vram_mb = Some(match parts[1].to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    let name = gpu_name?;
    let features: &[&str] = if name.contains("Apple") {
        &[FEATURE_SHADER_F16]
    } else {
        &[]
    };

    Some(AcceleratorInfo::new(
        format!("{} (Metal)", name),
        features,
        vram_mb.unwrap_or(0),
    ))
}
