//! Engine core
//!
//! Owns the loaded models, routes chat requests to them and exposes the
//! OpenAI-style API through the [`ChatEngine`] trait. The RPC client
//! implements the same trait, so callers do not care where the engine runs.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::inference::backend::{BackendError, ModelRuntime, RuntimeLoader, TokenId};
use crate::inference::conversation::ConversationState;
use crate::inference::pipeline::{GenerationConfig, GenerationOutcome, GenerationPipeline, PipelineError, StepDelta};
use crate::inference::sampler::SamplingConfig;
use crate::inference::template::ConvTemplate;
use crate::storage::artifact_cache::{ArtifactCache, ArtifactKind, CacheError};
use crate::storage::StorageError;
use crate::system::gpu::check_requirements;
use crate::types::config::{AppConfig, ChatOptions};
use crate::types::message::{ChatMessage, Role};
use crate::types::model::{ModelConfig, ModelRecord};
use crate::types::openai::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChunkChoice, ChunkDelta,
    ChoiceLogprobs, FinishReason, ToolChoice, Usage,
};
use crate::types::progress::{ProgressCallback, ProgressTracker};

/// Errors surfaced by the engine API; they cross the RPC boundary intact
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Model {model_id} needs accelerator support for: {}", missing.join(", "))]
    UnsupportedFeature { model_id: String, missing: Vec<String> },

    #[error("Several models are loaded ({}); specify one", loaded.join(", "))]
    AmbiguousModel { loaded: Vec<String> },

    #[error("Model not loaded: {}", model_id.as_deref().unwrap_or("no model is loaded"))]
    ModelNotLoaded { model_id: Option<String> },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Prompt needs {needed} tokens but the context window holds {window}")]
    ContextWindowExceeded { needed: usize, window: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl From<CacheError> for EngineError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Network { .. } => EngineError::Network(e.to_string()),
            CacheError::Integrity { .. } => EngineError::Integrity(e.to_string()),
            CacheError::Storage(_) => EngineError::Storage(e.to_string()),
            CacheError::InvalidArtifact { .. } => EngineError::ModelLoad(e.to_string()),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<BackendError> for EngineError {
    fn from(e: BackendError) -> Self {
        EngineError::Generation(e.0)
    }
}

impl From<PipelineError> for EngineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::ContextWindowExceeded { needed, window } => {
                EngineError::ContextWindowExceeded { needed, window }
            }
            PipelineError::Backend(e) => EngineError::Generation(e.0),
            PipelineError::Sampling(e) => EngineError::Generation(e.to_string()),
        }
    }
}

/// Stream of chat completion chunks
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Result<ChatCompletionChunk, EngineError>>,
}

impl ChunkStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<ChatCompletionChunk, EngineError>>) -> Self {
        Self { rx }
    }
}

impl Stream for ChunkStream {
    type Item = Result<ChatCompletionChunk, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
pub enum ChatResponse {
    Completion(ChatCompletion),
    Stream(ChunkStream),
}

impl ChatResponse {
    /// The completion of a non-streaming request
    pub fn into_completion(self) -> Result<ChatCompletion, EngineError> {
        match self {
            ChatResponse::Completion(completion) => Ok(completion),
            ChatResponse::Stream(_) => Err(EngineError::InvalidRequest(
                "expected a completion, got a stream".to_string(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<ChunkStream, EngineError> {
        match self {
            ChatResponse::Stream(stream) => Ok(stream),
            ChatResponse::Completion(_) => Err(EngineError::InvalidRequest(
                "expected a stream, got a completion".to_string(),
            )),
        }
    }
}

/// The engine API, implemented in-process by [`Engine`] and over a message
/// channel by the RPC client
#[async_trait]
pub trait ChatEngine: Send + Sync {
    /// Load `model_ids`, replacing any loaded instance of the same id.
    /// `chat_options[i]` overrides defaults for `model_ids[i]`.
    async fn reload(&self, model_ids: Vec<String>, chat_options: Vec<ChatOptions>) -> Result<(), EngineError>;

    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChatResponse, EngineError>;

    /// Last reply generated by the model
    async fn get_message(&self, model: Option<String>) -> Result<String, EngineError>;

    /// Release one model, or every model with `None`
    async fn unload(&self, model: Option<String>) -> Result<(), EngineError>;

    /// Stop the running generation of one model, or of every model with `None`
    async fn interrupt(&self, model: Option<String>) -> Result<(), EngineError>;

    async fn reset_chat(&self, model: Option<String>) -> Result<(), EngineError>;

    async fn runtime_stats_text(&self, model: Option<String>) -> Result<String, EngineError>;

    async fn has_model_in_cache(&self, model_id: String) -> Result<bool, EngineError>;

    async fn delete_model_all_info_in_cache(&self, model_id: String) -> Result<(), EngineError>;

    async fn delete_model_artifact(&self, model_id: String, kind: ArtifactKind) -> Result<(), EngineError>;

    fn set_progress_callback(&self, callback: Option<ProgressCallback>);
}

struct ModelSlot {
    runtime: Box<dyn ModelRuntime>,
    conversation: ConversationState,
}

#[derive(Debug, Default, Clone, Copy)]
struct RuntimeStats {
    prefill_tokens: usize,
    prefill_secs: f64,
    decode_tokens: usize,
    decode_secs: f64,
}

impl RuntimeStats {
    fn record(&mut self, outcome: &GenerationOutcome) {
        self.prefill_tokens += outcome.prompt_tokens;
        self.prefill_secs += outcome.prefill_secs;
        self.decode_tokens += outcome.completion_tokens;
        self.decode_secs += outcome.decode_secs;
    }

    fn text(&self) -> String {
        let rate = |tokens: usize, secs: f64| if secs > 0.0 { tokens as f64 / secs } else { 0.0 };
        format!(
            "prefill: {:.1} tokens/sec, decoding: {:.1} tokens/sec",
            rate(self.prefill_tokens, self.prefill_secs),
            rate(self.decode_tokens, self.decode_secs)
        )
    }
}

/// A model resident on the accelerator
pub struct LoadedModel {
    pub record: ModelRecord,
    pub config: ModelConfig,
    template: ConvTemplate,
    options: ChatOptions,
    context_window: usize,
    slot: Mutex<ModelSlot>,
    /// Cancellation flags of requests that are queued or running
    requests: DashMap<u64, Arc<AtomicBool>>,
    next_request: AtomicU64,
    released: AtomicBool,
    last_message: Mutex<String>,
    stats: Mutex<RuntimeStats>,
}

/// Registration of one request with its model; deregisters on drop
struct PendingRequest {
    model: Arc<LoadedModel>,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.model.requests.remove(&self.id);
    }
}

impl LoadedModel {
    fn register(self: &Arc<Self>) -> PendingRequest {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.requests.insert(id, cancelled.clone());
        // Unloaded while the caller still held the model
        if self.released.load(Ordering::SeqCst) {
            cancelled.store(true, Ordering::SeqCst);
        }
        PendingRequest {
            model: self.clone(),
            id,
            cancelled,
        }
    }

    /// Abort every queued and running request
    fn interrupt(&self) {
        for request in self.requests.iter() {
            request.value().store(true, Ordering::SeqCst);
        }
    }

    pub fn model_id(&self) -> &str {
        &self.record.model_id
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Merge request, reload options, chat config and defaults
    fn generation_config(&self, request: &ChatCompletionRequest) -> GenerationConfig {
        let defaults = SamplingConfig::default();
        let config = &self.config;
        let options = &self.options;

        let logit_bias: HashMap<TokenId, f32> = request
            .logit_bias
            .iter()
            .flatten()
            .filter_map(|(token, bias)| token.parse::<TokenId>().ok().map(|t| (t, *bias)))
            .collect();

        let mut stop_strings = self.template.stop_str.clone();
        if let Some(stop) = &request.stop {
            stop_strings.extend(stop.to_vec().into_iter().filter(|s| !s.is_empty()));
        }

        GenerationConfig {
            sampling: SamplingConfig {
                temperature: request
                    .temperature
                    .or(options.temperature)
                    .or(config.temperature)
                    .unwrap_or(defaults.temperature),
                top_p: request.top_p.or(options.top_p).or(config.top_p).unwrap_or(defaults.top_p),
                presence_penalty: request
                    .presence_penalty
                    .or(options.presence_penalty)
                    .or(config.presence_penalty)
                    .unwrap_or(defaults.presence_penalty),
                frequency_penalty: request
                    .frequency_penalty
                    .or(options.frequency_penalty)
                    .or(config.frequency_penalty)
                    .unwrap_or(defaults.frequency_penalty),
                repetition_penalty: request
                    .repetition_penalty
                    .or(options.repetition_penalty)
                    .or(config.repetition_penalty)
                    .unwrap_or(defaults.repetition_penalty),
                logit_bias,
                seed: request.seed,
                logprobs: request.logprobs,
                top_logprobs: request.top_logprobs.unwrap_or(0),
            },
            max_tokens: request.max_tokens,
            stop_strings,
            json_mode: request.json_mode(),
            tools: request.active_tools(),
            tool_choice: request.tool_choice.clone(),
            context_window: self.context_window,
            prefill_chunk_size: config.prefill_chunk_size,
        }
    }

    /// Everything besides the messages that shapes the prompt text
    fn context_key(&self, request: &ChatCompletionRequest) -> String {
        let named = match &request.tool_choice {
            Some(ToolChoice::Named(named)) => Some(named.function.name.as_str()),
            _ => None,
        };
        serde_json::json!({ "tools": request.active_tools(), "tool_choice": named }).to_string()
    }

    /// Run one request to completion while holding the slot lock
    async fn generate<F>(
        &self,
        slot: &mut ModelSlot,
        request: &ChatCompletionRequest,
        cancelled: &AtomicBool,
        on_delta: F,
    ) -> Result<GenerationOutcome, EngineError>
    where
        F: FnMut(StepDelta) -> bool + Send,
    {
        let ModelSlot { runtime, conversation } = slot;
        let mut pipeline = GenerationPipeline::new(
            runtime.as_mut(),
            conversation,
            &self.template,
            cancelled,
            self.generation_config(request),
        );
        let result = pipeline.run(&request.messages, &self.context_key(request), on_delta).await;
        tracing::debug!("Request on {} ended in phase {:?}", self.record.model_id, pipeline.phase());
        let outcome = result?;

        self.stats.lock().await.record(&outcome);
        *self.last_message.lock().await = outcome.message.content.clone();
        tracing::debug!(
            "{}: prompt {} tokens, completion {} tokens, finish {:?}",
            self.record.model_id,
            outcome.prompt_tokens,
            outcome.completion_tokens,
            outcome.finish_reason
        );
        Ok(outcome)
    }
}

/// In-process engine
pub struct Engine {
    app_config: AppConfig,
    cache: ArtifactCache,
    loader: Arc<dyn RuntimeLoader>,
    models: DashMap<String, Arc<LoadedModel>>,
    progress: RwLock<Option<ProgressCallback>>,
    reload_lock: Mutex<()>,
}

impl Engine {
    pub fn new(app_config: AppConfig, cache: ArtifactCache, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            app_config,
            cache,
            loader,
            models: DashMap::new(),
            progress: RwLock::new(None),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    /// Ids of resident models, sorted
    pub fn loaded_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        ids
    }

    fn find_record(&self, model_id: &str) -> Result<&ModelRecord, EngineError> {
        self.app_config
            .find_model(model_id)
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))
    }

    /// The named model, or the only loaded one
    fn resolve(&self, model: Option<&str>) -> Result<Arc<LoadedModel>, EngineError> {
        if let Some(id) = model {
            return self
                .models
                .get(id)
                .map(|m| m.value().clone())
                .ok_or_else(|| EngineError::ModelNotLoaded {
                    model_id: Some(id.to_string()),
                });
        }
        match self.models.len() {
            0 => Err(EngineError::ModelNotLoaded { model_id: None }),
            1 => self
                .models
                .iter()
                .next()
                .map(|m| m.value().clone())
                .ok_or(EngineError::ModelNotLoaded { model_id: None }),
            _ => Err(EngineError::AmbiguousModel {
                loaded: self.loaded_models(),
            }),
        }
    }

    fn progress_tracker(&self) -> ProgressTracker {
        let callback = match self.progress.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ProgressTracker::new(callback)
    }

    fn release(&self, model: Arc<LoadedModel>) {
        model.released.store(true, Ordering::SeqCst);
        model.interrupt();
        tracing::info!("Unloaded model {}", model.record.model_id);
    }

    async fn load_one(
        &self,
        record: &ModelRecord,
        options: ChatOptions,
        progress: &ProgressTracker,
    ) -> Result<LoadedModel, EngineError> {
        let artifacts = self.cache.fetch_model(record, progress).await?;
        let config = artifacts.config.clone();

        let template = match &options.conv_template {
            Some(template) => template.clone(),
            None => ConvTemplate::resolve(&config.conv_template).map_err(EngineError::ModelLoad)?,
        };
        let context_window = options
            .context_window_size
            .or(record.context_window_size)
            .unwrap_or(config.context_window_size);

        let runtime = self
            .loader
            .load(&artifacts)
            .await
            .map_err(|e| EngineError::ModelLoad(e.0))?;

        tracing::info!(
            "Loaded model {} (template {}, context window {})",
            record.model_id,
            template.name,
            context_window
        );
        Ok(LoadedModel {
            record: record.clone(),
            config,
            template,
            options,
            context_window,
            slot: Mutex::new(ModelSlot {
                runtime,
                conversation: ConversationState::new(),
            }),
            requests: DashMap::new(),
            next_request: AtomicU64::new(0),
            released: AtomicBool::new(false),
            last_message: Mutex::new(String::new()),
            stats: Mutex::new(RuntimeStats::default()),
        })
    }

    async fn complete(
        &self,
        pending: PendingRequest,
        request: ChatCompletionRequest,
        id: String,
        created: i64,
    ) -> Result<ChatCompletion, EngineError> {
        let model = &pending.model;
        let mut slot = model.slot.lock().await;

        let mut choices = Vec::with_capacity(request.choices());
        let mut usage = Usage::default();
        for index in 0..request.choices() {
            let outcome = model.generate(&mut slot, &request, &pending.cancelled, |_| true).await?;
            let choice_usage = outcome.usage();
            if index == 0 {
                usage = choice_usage;
            } else {
                usage.completion_tokens += choice_usage.completion_tokens;
                usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
            }
            choices.push(ChatChoice {
                index,
                message: outcome.message,
                finish_reason: outcome.finish_reason,
                logprobs: outcome.logprobs,
            });
        }

        Ok(ChatCompletion {
            id,
            object: "chat.completion".to_string(),
            created,
            model: model.record.model_id.clone(),
            choices,
            usage,
        })
    }
}

fn chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: ChunkDelta,
    finish_reason: Option<FinishReason>,
    logprobs: Option<ChoiceLogprobs>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
            logprobs,
        }],
        usage: None,
    }
}

async fn stream_completion(
    pending: PendingRequest,
    request: ChatCompletionRequest,
    id: String,
    created: i64,
    tx: mpsc::UnboundedSender<Result<ChatCompletionChunk, EngineError>>,
) {
    let model = &pending.model;
    let mut slot = model.slot.lock().await;
    let model_id = model.record.model_id.clone();

    let opening = ChunkDelta {
        role: Some(Role::Assistant),
        content: Some(String::new()),
        tool_calls: Vec::new(),
    };
    if tx.send(Ok(chunk(&id, created, &model_id, opening, None, None))).is_err() {
        return;
    }

    let result = model
        .generate(&mut slot, &request, &pending.cancelled, |delta: StepDelta| {
            let logprobs = (!delta.logprobs.is_empty()).then(|| ChoiceLogprobs {
                content: delta.logprobs,
            });
            let content = ChunkDelta {
                role: None,
                content: Some(delta.text),
                tool_calls: Vec::new(),
            };
            tx.send(Ok(chunk(&id, created, &model_id, content, None, logprobs))).is_ok()
        })
        .await;

    match result {
        Ok(outcome) => {
            let closing = ChunkDelta {
                role: None,
                content: None,
                tool_calls: outcome.message.tool_calls.clone(),
            };
            let _ = tx.send(Ok(chunk(&id, created, &model_id, closing, Some(outcome.finish_reason), None)));
            if request.include_usage() {
                let mut usage_chunk = chunk(&id, created, &model_id, ChunkDelta::default(), None, None);
                usage_chunk.choices.clear();
                usage_chunk.usage = Some(outcome.usage());
                let _ = tx.send(Ok(usage_chunk));
            }
        }
        Err(e) => {
            tracing::warn!("Streaming request on {} failed: {}", model_id, e);
            let _ = tx.send(Err(e));
        }
    }
}

#[async_trait]
impl ChatEngine for Engine {
    async fn reload(&self, model_ids: Vec<String>, chat_options: Vec<ChatOptions>) -> Result<(), EngineError> {
        if model_ids.is_empty() {
            return Err(EngineError::InvalidRequest("no model ids given".to_string()));
        }
        if chat_options.len() > model_ids.len() {
            return Err(EngineError::InvalidRequest(format!(
                "{} chat options for {} models",
                chat_options.len(),
                model_ids.len()
            )));
        }
        for (i, id) in model_ids.iter().enumerate() {
            if model_ids[..i].contains(id) {
                return Err(EngineError::InvalidRequest(format!("model {id} listed twice")));
            }
        }

        let records: Vec<ModelRecord> = model_ids
            .iter()
            .map(|id| self.find_record(id).cloned())
            .collect::<Result<_, _>>()?;

        // Nothing is downloaded unless every model can run here
        let accelerator = self.loader.accelerator();
        for record in &records {
            if let Err(missing) = check_requirements(record, &accelerator) {
                return Err(EngineError::UnsupportedFeature {
                    model_id: record.model_id.clone(),
                    missing,
                });
            }
        }

        let _reloading = self.reload_lock.lock().await;
        let tracker = self.progress_tracker();
        let total = records.len() as f64;
        let mut options = chat_options.into_iter();
        for (i, record) in records.iter().enumerate() {
            if let Some((_, previous)) = self.models.remove(&record.model_id) {
                self.release(previous);
            }
            let span = tracker.span(i as f64 / total, (i + 1) as f64 / total);
            let loaded = self.load_one(record, options.next().unwrap_or_default(), &span).await?;
            self.models.insert(record.model_id.clone(), Arc::new(loaded));
        }
        Ok(())
    }

    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChatResponse, EngineError> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let model = self.resolve(request.model.as_deref())?;
        tracing::debug!(
            "Chat request for {} (stream: {}): {:?}",
            model.model_id(),
            request.stream,
            last_user_text(&request.messages).map(|t| t.chars().take(80).collect::<String>())
        );

        let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let created = chrono::Utc::now().timestamp();
        // Registered before returning so an immediate interrupt reaches it
        let pending = model.register();

        if request.stream {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(stream_completion(pending, request, id, created, tx));
            Ok(ChatResponse::Stream(ChunkStream::new(rx)))
        } else {
            Ok(ChatResponse::Completion(self.complete(pending, request, id, created).await?))
        }
    }

    async fn get_message(&self, model: Option<String>) -> Result<String, EngineError> {
        let model = self.resolve(model.as_deref())?;
        let message = model.last_message.lock().await.clone();
        Ok(message)
    }

    async fn unload(&self, model: Option<String>) -> Result<(), EngineError> {
        match model {
            Some(id) => {
                let (_, loaded) = self
                    .models
                    .remove(&id)
                    .ok_or(EngineError::ModelNotLoaded { model_id: Some(id) })?;
                self.release(loaded);
            }
            None => {
                for id in self.loaded_models() {
                    if let Some((_, loaded)) = self.models.remove(&id) {
                        self.release(loaded);
                    }
                }
            }
        }
        Ok(())
    }

    async fn interrupt(&self, model: Option<String>) -> Result<(), EngineError> {
        match model {
            Some(id) => self.resolve(Some(&id))?.interrupt(),
            None => {
                for model in self.models.iter() {
                    model.interrupt();
                }
            }
        }
        Ok(())
    }

    async fn reset_chat(&self, model: Option<String>) -> Result<(), EngineError> {
        let model = self.resolve(model.as_deref())?;
        let mut slot = model.slot.lock().await;
        slot.conversation.reset();
        slot.runtime.truncate_kv(0);
        *model.stats.lock().await = RuntimeStats::default();
        tracing::debug!("Chat reset for {}", model.record.model_id);
        Ok(())
    }

    async fn runtime_stats_text(&self, model: Option<String>) -> Result<String, EngineError> {
        let model = self.resolve(model.as_deref())?;
        let stats = *model.stats.lock().await;
        Ok(stats.text())
    }

    async fn has_model_in_cache(&self, model_id: String) -> Result<bool, EngineError> {
        let record = self.find_record(&model_id)?;
        Ok(self.cache.has(record).await?)
    }

    async fn delete_model_all_info_in_cache(&self, model_id: String) -> Result<(), EngineError> {
        let record = self.find_record(&model_id)?;
        self.cache.delete_all(record).await?;
        Ok(())
    }

    async fn delete_model_artifact(&self, model_id: String, kind: ArtifactKind) -> Result<(), EngineError> {
        let record = self.find_record(&model_id)?;
        self.cache.delete_artifact(record, kind).await?;
        Ok(())
    }

    fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        let mut guard = match self.progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = callback;
    }
}

/// Text of the last user message, for logging
pub fn last_user_text(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{mock_record, publish_mock_model, MockLoader};
    use crate::storage::blob_store::BlobStore;
    use crate::storage::fetch::StaticFetcher;
    use futures::StreamExt;
    use std::time::Duration;

    fn engine_with(loader: MockLoader, ids: &[&str]) -> (tempfile::TempDir, Engine) {
        let fetcher = StaticFetcher::new().shared();
        let mut app_config = AppConfig::default();
        for id in ids {
            let record = mock_record(id);
            publish_mock_model(&fetcher, &record);
            app_config.model_list.push(record);
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(BlobStore::open(dir.path(), None).unwrap());
        let cache = ArtifactCache::new(backend, fetcher);
        (dir, Engine::new(app_config, cache, Arc::new(loader)))
    }

    #[test]
    fn test_error_serialization() {
        let err = EngineError::ContextWindowExceeded { needed: 10, window: 8 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "context_window_exceeded");
        let back: EngineError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[tokio::test]
    async fn test_request_without_model_loaded() {
        let (_dir, engine) = engine_with(MockLoader::new(["hi"]), &["a"]);
        let err = engine
            .chat_completion(ChatCompletionRequest::new(vec![ChatMessage::user("hello")]))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::ModelNotLoaded { model_id: None });
    }

    #[tokio::test]
    async fn test_completion_and_get_message() {
        let (_dir, engine) = engine_with(MockLoader::new(["Hello there."]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let completion = engine
            .chat_completion(ChatCompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap()
            .into_completion()
            .unwrap();
        assert_eq!(completion.choices[0].message.content, "Hello there.");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(completion.usage.completion_tokens, "Hello there.".len());
        assert_eq!(engine.get_message(None).await.unwrap(), "Hello there.");
        assert!(engine.runtime_stats_text(None).await.unwrap().starts_with("prefill: "));
    }

    #[tokio::test]
    async fn test_streaming_chunks_concatenate_to_reply() {
        let (_dir, engine) = engine_with(MockLoader::new(["Streamed reply"]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("hi")]);
        request.stream = true;
        request.stream_options = Some(crate::types::openai::StreamOptions { include_usage: true });
        let mut stream = engine.chat_completion(request).await.unwrap().into_stream().unwrap();

        let mut text = String::new();
        let mut finish = None;
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(u) = chunk.usage {
                usage = Some(u);
            }
            for choice in chunk.choices {
                text.push_str(choice.delta.content.as_deref().unwrap_or(""));
                finish = finish.or(choice.finish_reason);
            }
        }
        assert_eq!(text, "Streamed reply");
        assert_eq!(finish, Some(FinishReason::Stop));
        assert_eq!(usage.unwrap().completion_tokens, "Streamed reply".len());
    }

    #[tokio::test]
    async fn test_stop_string_and_max_tokens() {
        let (_dir, engine) = engine_with(MockLoader::new(["alpha. STOP beta"]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("go")]);
        request.stop = Some(crate::types::openai::StopSequences::One(" STOP".into()));
        let completion = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        assert_eq!(completion.choices[0].message.content, "alpha.");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("again")]);
        request.max_tokens = Some(3);
        let completion = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        assert_eq!(completion.choices[0].message.content, "alp");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_stop_string_round_can_be_extended() {
        let (_dir, engine) = engine_with(MockLoader::new(["alpha. STOP beta"]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let first_turn = vec![ChatMessage::user("go")];
        let mut request = ChatCompletionRequest::new(first_turn.clone());
        request.stop = Some(crate::types::openai::StopSequences::One(" STOP".into()));
        let first = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        let reply = first.choices[0].message.content.clone();
        assert_eq!(reply, "alpha.");

        let follow_up = vec![first_turn[0].clone(), ChatMessage::assistant(reply), ChatMessage::user("next")];
        let reused = engine
            .chat_completion(ChatCompletionRequest::new(follow_up.clone()))
            .await
            .unwrap()
            .into_completion()
            .unwrap();
        engine.reset_chat(None).await.unwrap();
        let cold = engine
            .chat_completion(ChatCompletionRequest::new(follow_up))
            .await
            .unwrap()
            .into_completion()
            .unwrap();

        // The reused prefix is exactly the first prompt plus "alpha."
        let first_kv = first.usage.prompt_tokens + "alpha.".len();
        assert_eq!(reused.usage.prompt_tokens + first_kv, cold.usage.prompt_tokens);
    }

    #[tokio::test]
    async fn test_interrupt_right_after_stream_starts() {
        let loader = MockLoader::new(["a fairly long reply to interrupt"]).with_step_delay(Duration::from_millis(2));
        let (_dir, engine) = engine_with(loader, &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("talk")]);
        request.stream = true;
        let mut stream = engine.chat_completion(request).await.unwrap().into_stream().unwrap();
        engine.interrupt(None).await.unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(chunk) = stream.next().await {
            for choice in chunk.unwrap().choices {
                text.push_str(choice.delta.content.as_deref().unwrap_or(""));
                finish = finish.or(choice.finish_reason);
            }
        }
        assert_eq!(finish, Some(FinishReason::Abort));
        assert!(text.len() < "a fairly long reply to interrupt".len());

        // The flag belonged to that request only
        let next = engine
            .chat_completion(ChatCompletionRequest::new(vec![ChatMessage::user("talk")]))
            .await
            .unwrap()
            .into_completion()
            .unwrap();
        assert_eq!(next.choices[0].finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_multiple_choices() {
        let (_dir, engine) = engine_with(MockLoader::new(["one", "two"]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("count")]);
        request.n = Some(2);
        let completion = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        let replies: Vec<&str> = completion.choices.iter().map(|c| c.message.content.as_str()).collect();
        assert_eq!(replies, vec!["one", "two"]);
        assert_eq!(engine.get_message(None).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_json_mode_stops_at_closed_object() {
        let (_dir, engine) = engine_with(MockLoader::new([r#"{"states": ["Ohio"]} trailing"#]), &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("json please")]);
        request.response_format = Some(crate::types::openai::ResponseFormat {
            kind: crate::types::openai::ResponseFormatKind::JsonObject,
            ..Default::default()
        });
        let completion = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        assert_eq!(completion.choices[0].message.content, r#"{"states": ["Ohio"]}"#);
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_tool_call_reply() {
        let (_dir, engine) = engine_with(
            MockLoader::new([r#"[{"name": "get_weather", "arguments": {"city": "Paris"}}]"#]),
            &["a"],
        );
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("weather in Paris?")]);
        request.tools = Some(vec![crate::types::openai::ChatTool {
            kind: "function".into(),
            function: crate::types::openai::FunctionDefinition {
                name: "get_weather".into(),
                description: String::new(),
                parameters: serde_json::json!({"type": "object"}),
            },
        }]);
        let completion = engine.chat_completion(request).await.unwrap().into_completion().unwrap();
        let choice = &completion.choices[0];
        assert_eq!(choice.finish_reason, FinishReason::ToolCalls);
        assert_eq!(choice.message.tool_calls[0].function.name, "get_weather");
        assert!(choice.message.content.is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_resets_state() {
        let loader = MockLoader::new(["abcdef"]).failing_at_decode(3);
        let stats = loader.stats();
        let (_dir, engine) = engine_with(loader, &["a"]);
        engine.reload(vec!["a".into()], vec![]).await.unwrap();

        let messages = vec![ChatMessage::user("first")];
        let err = engine
            .chat_completion(ChatCompletionRequest::new(messages.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));

        // The next request prefills from scratch and succeeds
        let before = stats.prefill_tokens();
        engine.chat_completion(ChatCompletionRequest::new(messages)).await.unwrap();
        assert!(stats.prefill_tokens() > before);
    }

    #[tokio::test]
    async fn test_unload_releases_runtime() {
        let loader = MockLoader::new(["x"]);
        let stats = loader.stats();
        let (_dir, engine) = engine_with(loader, &["a", "b"]);
        engine.reload(vec!["a".into(), "b".into()], vec![]).await.unwrap();
        assert_eq!(engine.loaded_models(), vec!["a".to_string(), "b".to_string()]);

        engine.unload(Some("a".into())).await.unwrap();
        assert_eq!(stats.released(), 1);
        assert_eq!(
            engine.unload(Some("a".into())).await.unwrap_err(),
            EngineError::ModelNotLoaded { model_id: Some("a".into()) }
        );
        engine.unload(None).await.unwrap();
        assert_eq!(stats.released(), 2);
        assert!(engine.loaded_models().is_empty());
    }

    #[tokio::test]
    async fn test_context_window_exceeded() {
        let (_dir, engine) = engine_with(MockLoader::new(["x"]), &["a"]);
        let options = ChatOptions {
            context_window_size: Some(32),
            ..ChatOptions::default()
        };
        engine.reload(vec!["a".into()], vec![options]).await.unwrap();

        let long = "word ".repeat(20);
        let err = engine
            .chat_completion(ChatCompletionRequest::new(vec![ChatMessage::user(long)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ContextWindowExceeded { window: 32, .. }));
    }

    #[test]
    fn test_last_user_text() {
        let messages = vec![ChatMessage::user("a"), ChatMessage::assistant("b"), ChatMessage::user("c")];
        assert_eq!(last_user_text(&messages), Some("c"));
    }
}
