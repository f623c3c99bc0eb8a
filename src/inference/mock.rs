//! Deterministic runtime for tests and demos
//!
//! A byte-level tokenizer plus a runtime that "generates" scripted replies,
//! and helpers that publish a complete model (config, tokenizer, manifest,
//! shards, kernel library) on a [`StaticFetcher`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::inference::backend::{BackendError, ModelRuntime, RuntimeLoader, TokenId, Tokenizer};
use crate::storage::artifact_cache::{ModelArtifacts, CONFIG_FILE};
use crate::storage::fetch::{join_url, StaticFetcher};
use crate::storage::manifest::{ParamRecord, ShardRecord, WeightManifest, MANIFEST_FILE};
use crate::system::gpu::{AcceleratorInfo, FEATURE_SHADER_F16};
use crate::types::model::{ConvTemplateConfig, ModelConfig, ModelRecord};

/// End-of-sequence token
pub const EOS: TokenId = 256;
pub const VOCAB_SIZE: usize = 257;

const TARGET_LOGIT: f32 = 30.0;

/// One token per byte, plus [`EOS`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        u8::try_from(token).map(|b| vec![b]).unwrap_or_default()
    }

    fn is_stop_token(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Call counters shared by a loader and every runtime it creates
#[derive(Debug, Default)]
pub struct MockStats {
    pub loads: AtomicUsize,
    pub released: AtomicUsize,
    pub prefill_calls: AtomicUsize,
    pub prefill_tokens: AtomicUsize,
    pub decode_calls: AtomicUsize,
}

impl MockStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn prefill_tokens(&self) -> usize {
        self.prefill_tokens.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }
}

/// Runtime whose logits spell out scripted replies.
///
/// Each request (the first prefill after a decode) moves to the next reply.
/// Logits always peak on the next byte of the current reply, then on [`EOS`].
pub struct MockRuntime {
    tokenizer: ByteTokenizer,
    kv: Vec<TokenId>,
    replies: Arc<Vec<String>>,
    round: usize,
    cursor: usize,
    prefilling: bool,
    step_delay: Option<Duration>,
    fail_at_decode: Option<usize>,
    stats: Arc<MockStats>,
}

impl MockRuntime {
    /// A standalone runtime with its own counters
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            tokenizer: ByteTokenizer,
            kv: Vec::new(),
            replies: Arc::new(replies.into_iter().map(Into::into).collect()),
            round: 0,
            cursor: 0,
            prefilling: false,
            step_delay: None,
            fail_at_decode: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Prompt plus generated tokens currently in the KV cache, as text
    pub fn kv_text(&self) -> String {
        let bytes: Vec<u8> = self.kv.iter().filter_map(|t| u8::try_from(*t).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn current_reply(&self) -> &[u8] {
        if self.replies.is_empty() {
            return &[];
        }
        let index = (self.round.max(1) - 1) % self.replies.len();
        self.replies[index].as_bytes()
    }

    fn logits(&self) -> Vec<f32> {
        let target = self
            .current_reply()
            .get(self.cursor)
            .map(|b| TokenId::from(*b))
            .unwrap_or(EOS);
        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[target as usize] = TARGET_LOGIT;
        logits
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelRuntime for MockRuntime {
    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn kv_len(&self) -> usize {
        self.kv.len()
    }

    async fn prefill(&mut self, tokens: &[TokenId], start_pos: usize) -> Result<Vec<f32>, BackendError> {
        if start_pos != self.kv.len() {
            return Err(BackendError(format!(
                "prefill at position {start_pos} but KV cache holds {} tokens",
                self.kv.len()
            )));
        }
        if !self.prefilling {
            self.prefilling = true;
            self.round += 1;
            self.cursor = 0;
        }
        self.stats.prefill_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.prefill_tokens.fetch_add(tokens.len(), Ordering::SeqCst);
        self.kv.extend_from_slice(tokens);
        Ok(self.logits())
    }

    async fn decode_step(&mut self, token: TokenId, pos: usize) -> Result<Vec<f32>, BackendError> {
        if pos != self.kv.len() {
            return Err(BackendError(format!(
                "decode at position {pos} but KV cache holds {} tokens",
                self.kv.len()
            )));
        }
        let call = self.stats.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at_decode == Some(call) {
            return Err(BackendError::new("device lost"));
        }
        if let Some(delay) = self.step_delay {
            tokio::time::sleep(delay).await;
        }
        self.prefilling = false;
        self.kv.push(token);
        self.cursor += 1;
        Ok(self.logits())
    }

    fn truncate_kv(&mut self, len: usize) {
        self.kv.truncate(len);
    }
}

/// Loader producing [`MockRuntime`]s
pub struct MockLoader {
    accelerator: AcceleratorInfo,
    replies: Arc<Vec<String>>,
    step_delay: Option<Duration>,
    fail_at_decode: Option<usize>,
    stats: Arc<MockStats>,
}

impl MockLoader {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            accelerator: AcceleratorInfo::new("mock accelerator", &[FEATURE_SHADER_F16], 8192),
            replies: Arc::new(replies.into_iter().map(Into::into).collect()),
            step_delay: None,
            fail_at_decode: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn with_accelerator(mut self, accelerator: AcceleratorInfo) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Sleep in every decode step, so requests can be interrupted mid-flight
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Fail the n-th decode step (1-based, counted across runtimes)
    pub fn failing_at_decode(mut self, call: usize) -> Self {
        self.fail_at_decode = Some(call);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl RuntimeLoader for MockLoader {
    fn accelerator(&self) -> AcceleratorInfo {
        self.accelerator.clone()
    }

    async fn load(&self, artifacts: &ModelArtifacts) -> Result<Box<dyn ModelRuntime>, BackendError> {
        if artifacts.kernel_library.is_empty() {
            return Err(BackendError::new("empty kernel library"));
        }
        // Touch every parameter the way a real loader uploads them
        for shard in &artifacts.manifest.records {
            for param in &shard.records {
                let data = artifacts
                    .param(&param.name)
                    .await
                    .map_err(|e| BackendError(e.to_string()))?;
                if data.len() as u64 != param.nbytes {
                    return Err(BackendError(format!("parameter {} truncated", param.name)));
                }
            }
        }

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRuntime {
            tokenizer: ByteTokenizer,
            kv: Vec::new(),
            replies: self.replies.clone(),
            round: 0,
            cursor: 0,
            prefilling: false,
            step_delay: self.step_delay,
            fail_at_decode: self.fail_at_decode,
            stats: self.stats.clone(),
        }))
    }
}

/// Record of a mock model served from `mem://`
pub fn mock_record(model_id: &str) -> ModelRecord {
    ModelRecord {
        model_id: model_id.to_string(),
        model_url: format!("mem://models/{model_id}/"),
        model_lib: format!("mem://libs/{model_id}-webgpu.wasm"),
        required_features: vec![FEATURE_SHADER_F16.to_string()],
        vram_required_mb: Some(1024.0),
        low_resource_required: true,
        quantization: Some("q4f16_1".to_string()),
        context_window_size: None,
    }
}

/// Default chat config of mock models
pub fn mock_config() -> ModelConfig {
    ModelConfig {
        conv_template: ConvTemplateConfig::Named("chatml".to_string()),
        context_window_size: 2048,
        prefill_chunk_size: Some(64),
        temperature: Some(0.0),
        ..ModelConfig::default()
    }
}

/// Publish every artifact of `record` on `fetcher`
pub fn publish_mock_model(fetcher: &StaticFetcher, record: &ModelRecord) {
    publish_mock_model_with(fetcher, record, &mock_config());
}

pub fn publish_mock_model_with(fetcher: &StaticFetcher, record: &ModelRecord, config: &ModelConfig) {
    let base = &record.model_url;
    let config_json = serde_json::to_vec(config).unwrap_or_default();
    fetcher.insert(join_url(base, CONFIG_FILE), config_json);
    for file in &config.tokenizer_files {
        fetcher.insert(join_url(base, file), Bytes::from_static(b"{\"model\":\"byte-level\"}"));
    }

    let mut records = Vec::new();
    for (index, nbytes) in [(0usize, 96u64), (1, 64)] {
        let data: Vec<u8> = (0..nbytes).map(|i| (i as u8).wrapping_mul(31).wrapping_add(index as u8)).collect();
        let data_path = format!("params_shard_{index}.bin");
        fetcher.insert(join_url(base, &data_path), data);
        records.push(ShardRecord {
            data_path,
            format: Some("raw-shard".to_string()),
            nbytes,
            sha256: None,
            records: vec![
                ParamRecord {
                    name: format!("layer{index}.weight"),
                    shape: vec![nbytes / 4 - 4, 2],
                    dtype: "float16".to_string(),
                    format: Some("raw".to_string()),
                    nbytes: nbytes - 16,
                    byte_offset: 0,
                },
                ParamRecord {
                    name: format!("layer{index}.scale"),
                    shape: vec![8],
                    dtype: "float16".to_string(),
                    format: Some("raw".to_string()),
                    nbytes: 16,
                    byte_offset: nbytes - 16,
                },
            ],
        });
    }
    let manifest = WeightManifest {
        metadata: serde_json::json!({ "ParamSize": 4 }),
        records,
    };
    fetcher.insert(
        join_url(base, MANIFEST_FILE),
        serde_json::to_vec(&manifest).unwrap_or_default(),
    );
    fetcher.insert(record.model_lib.clone(), Bytes::from_static(b"\0asm mock kernels"));
}
