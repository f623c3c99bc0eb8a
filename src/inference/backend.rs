//! Accelerator runtime capabilities
//!
//! The numeric kernels and the tokenizer are consumed through these traits.
//! A runtime holds accelerator-resident weights plus a KV cache and exposes
//! two operations: prefill a batch of tokens, and run one decode step.

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::artifact_cache::ModelArtifacts;
use crate::system::gpu::AcceleratorInfo;

pub type TokenId = u32;

/// Error raised by a runtime or tokenizer
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    /// Raw bytes of a single token; may be a partial UTF-8 sequence
    fn token_bytes(&self, token: TokenId) -> Vec<u8>;

    /// End-of-sequence and other tokens that always stop generation
    fn is_stop_token(&self, token: TokenId) -> bool;

    fn vocab_size(&self) -> usize;
}

/// A model brought up on the accelerator
#[async_trait]
pub trait ModelRuntime: Send {
    fn tokenizer(&self) -> &dyn Tokenizer;

    /// Tokens currently held in the KV cache
    fn kv_len(&self) -> usize;

    /// Run `tokens` through the model at positions `start_pos..`, appending
    /// them to the KV cache. Returns the logits for the last position.
    async fn prefill(&mut self, tokens: &[TokenId], start_pos: usize) -> Result<Vec<f32>, BackendError>;

    /// Forward a single token at `pos`. Returns the next-token logits.
    async fn decode_step(&mut self, token: TokenId, pos: usize) -> Result<Vec<f32>, BackendError>;

    /// Drop KV entries beyond `len`
    fn truncate_kv(&mut self, len: usize);
}

/// Brings models up on a particular accelerator
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    fn accelerator(&self) -> AcceleratorInfo;

    async fn load(&self, artifacts: &ModelArtifacts) -> Result<Box<dyn ModelRuntime>, BackendError>;
}
