//! WebLLM Library
//!
//! Core library for serving chat models: an artifact cache, a generation
//! pipeline with conversation reuse, a multi-model engine, and an RPC layer
//! that lets the engine run in a separate worker.

pub mod inference;
pub mod rpc;
pub mod storage;
pub mod system;
pub mod types;
