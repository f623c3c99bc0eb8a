//! LLM inference engine
//!
//! This module turns cached artifacts into a resident model and runs chat
//! requests against it: prompt templates, conversation reuse, sampling,
//! JSON mode, function calling, and the engine that ties them together.

pub mod backend;
pub mod conversation;
pub mod engine;
pub mod grammar;
pub mod mock;
pub mod pipeline;
pub mod sampler;
pub mod template;
pub mod tools;

pub use engine::{ChatEngine, ChatResponse, ChunkStream, Engine, EngineError};
