//! System utilities
//!
//! This module provides accelerator detection and requirement checks.

pub mod gpu;
