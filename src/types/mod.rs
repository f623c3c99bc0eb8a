//! Shared type definitions
//!
//! This module contains the data types shared by the cache, the engine and
//! the worker protocol.

pub mod config;
pub mod message;
pub mod model;
pub mod openai;
pub mod progress;
