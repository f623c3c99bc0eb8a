//! Generation pipeline
//!
//! Runs one chat request against a loaded model:
//! `Idle -> Prefilling -> Decoding -> {Completed | Interrupted | Failed}`.
//!
//! The pipeline owns nothing. It borrows the model's runtime and
//! conversation state for the duration of the request, which the engine
//! guarantees by holding the model's slot lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use crate::inference::backend::{BackendError, ModelRuntime, TokenId};
use crate::inference::conversation::ConversationState;
use crate::inference::grammar::JsonPrefixValidator;
use crate::inference::sampler::{SampledToken, Sampler, SamplingConfig, SamplingError};
use crate::inference::template::ConvTemplate;
use crate::inference::tools::{build_tool_instructions, extract_tool_calls};
use crate::types::message::ChatMessage;
use crate::types::openai::{
    ChatTool, ChoiceLogprobs, FinishReason, TokenLogprob, ToolChoice, TopLogprob, Usage, UsageExtra,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("prompt needs {needed} tokens but the context window holds {window}")]
    ContextWindowExceeded { needed: usize, window: usize },

    #[error("runtime error: {0}")]
    Backend(#[from] BackendError),

    #[error("sampling error: {0}")]
    Sampling(#[from] SamplingError),
}

/// Per-request generation settings, already merged with model defaults
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub sampling: SamplingConfig,
    pub max_tokens: Option<usize>,
    /// Request stop sequences plus the template's
    pub stop_strings: Vec<String>,
    pub json_mode: bool,
    pub tools: Vec<ChatTool>,
    pub tool_choice: Option<ToolChoice>,
    pub context_window: usize,
    pub prefill_chunk_size: Option<usize>,
}

/// One increment of generated output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDelta {
    pub text: String,
    pub logprobs: Vec<TokenLogprob>,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    pub logprobs: Option<ChoiceLogprobs>,
    /// Tokens prefilled for this request (the reused prefix excluded)
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub prefill_secs: f64,
    pub decode_secs: f64,
    pub time_to_first_token_secs: f64,
}

impl GenerationOutcome {
    pub fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.prompt_tokens + self.completion_tokens,
            extra: UsageExtra {
                prefill_tokens_per_s: rate(self.prompt_tokens, self.prefill_secs),
                decode_tokens_per_s: rate(self.completion_tokens, self.decode_secs),
                time_to_first_token_s: self.time_to_first_token_secs,
            },
        }
    }
}

fn rate(tokens: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// Decodes token bytes into text without splitting multi-byte characters
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Earliest occurrence of any stop string
fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Length of the longest suffix of `text` that could start a stop string
fn held_back_len(text: &str, stops: &[String]) -> usize {
    stops
        .iter()
        .flat_map(|stop| {
            stop.char_indices()
                .skip(1)
                .map(move |(k, _)| &stop[..k])
                .filter(|prefix| text.ends_with(prefix))
                .map(str::len)
        })
        .max()
        .unwrap_or(0)
}

pub struct GenerationPipeline<'a> {
    runtime: &'a mut dyn ModelRuntime,
    conversation: &'a mut ConversationState,
    template: &'a ConvTemplate,
    stop_signal: &'a AtomicBool,
    config: GenerationConfig,
    phase: PipelinePhase,
}

impl<'a> GenerationPipeline<'a> {
    pub fn new(
        runtime: &'a mut dyn ModelRuntime,
        conversation: &'a mut ConversationState,
        template: &'a ConvTemplate,
        stop_signal: &'a AtomicBool,
        config: GenerationConfig,
    ) -> Self {
        Self {
            runtime,
            conversation,
            template,
            stop_signal,
            config,
            phase: PipelinePhase::Idle,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Generate a reply to `messages`.
    ///
    /// `on_delta` receives streamed text; returning `false` aborts the
    /// request. Any error, and any abort, leaves the conversation state
    /// reset so the next request starts from token zero.
    pub async fn run<F>(
        &mut self,
        messages: &[ChatMessage],
        context_key: &str,
        on_delta: F,
    ) -> Result<GenerationOutcome, PipelineError>
    where
        F: FnMut(StepDelta) -> bool + Send,
    {
        match self.generate(messages, context_key, on_delta).await {
            Ok(outcome) => {
                if outcome.finish_reason == FinishReason::Abort {
                    self.phase = PipelinePhase::Interrupted;
                    self.invalidate();
                } else {
                    self.phase = PipelinePhase::Completed;
                }
                Ok(outcome)
            }
            Err(e) => {
                self.phase = PipelinePhase::Failed;
                self.invalidate();
                Err(e)
            }
        }
    }

    fn invalidate(&mut self) {
        self.conversation.reset();
        self.runtime.truncate_kv(0);
    }

    fn is_interrupted(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    async fn generate<F>(
        &mut self,
        messages: &[ChatMessage],
        context_key: &str,
        mut on_delta: F,
    ) -> Result<GenerationOutcome, PipelineError>
    where
        F: FnMut(StepDelta) -> bool + Send,
    {
        let started = Instant::now();
        self.phase = PipelinePhase::Prefilling;

        let reconciliation = self.conversation.reconcile(messages, context_key);
        let reusable = reconciliation.reusable_prefix_tokens;
        tracing::debug!(
            "Reusing {} KV tokens, prefilling {} messages",
            reusable,
            reconciliation.messages_to_prefill.len()
        );

        let tool_instructions = build_tool_instructions(&self.config.tools, self.config.tool_choice.as_ref());
        let prompt = self.template.render(
            messages,
            reconciliation.prefill_from,
            reconciliation.continues_open_turn,
            Some(tool_instructions.as_str()),
        );

        self.runtime.truncate_kv(reusable);
        let prompt_tokens = self.runtime.tokenizer().encode(&prompt)?;
        if prompt_tokens.is_empty() {
            return Err(BackendError::new("prompt encoded to no tokens").into());
        }

        let window = self.config.context_window;
        let needed = reusable + prompt_tokens.len();
        // At least one token must fit after the prompt
        if needed >= window {
            return Err(PipelineError::ContextWindowExceeded { needed, window });
        }

        let chunk_size = self.config.prefill_chunk_size.unwrap_or(usize::MAX).max(1);
        let mut pos = reusable;
        let mut logits = Vec::new();
        for chunk in prompt_tokens.chunks(chunk_size) {
            if self.is_interrupted() {
                return Ok(self.aborted(prompt_tokens.len(), started));
            }
            logits = self.runtime.prefill(chunk, pos).await?;
            pos += chunk.len();
            self.conversation.commit(pos);
        }
        let prefill_secs = started.elapsed().as_secs_f64();

        self.phase = PipelinePhase::Decoding;
        let decode_started = Instant::now();
        let reply_start = pos;
        let mut time_to_first_token = None;

        let mut sampler = Sampler::new(self.config.sampling.clone());
        let mut json = self.config.json_mode.then(JsonPrefixValidator::new);
        let mut decoder = Utf8Decoder::default();
        let want_logprobs = self.config.sampling.logprobs;

        let mut text = String::new();
        let mut emitted = 0usize;
        let mut all_logprobs: Vec<TokenLogprob> = Vec::new();
        let mut unsent_logprobs: Vec<TokenLogprob> = Vec::new();
        let mut generated = 0usize;
        let mut unfed: Option<TokenId> = None;
        // Text length after each generated token, when it ends on a character boundary
        let mut token_ends: Vec<Option<usize>> = Vec::new();
        let mut stopped_at: Option<usize> = None;
        let max_tokens = self.config.max_tokens.unwrap_or(usize::MAX);

        let finish_reason = loop {
            if self.is_interrupted() {
                break FinishReason::Abort;
            }

            let mask = json.as_ref().map(|validator| self.json_mask(validator, logits.len()));
            let sampled = sampler.sample(&logits, mask.as_deref())?;
            if time_to_first_token.is_none() {
                time_to_first_token = Some(started.elapsed().as_secs_f64());
            }

            let token = sampled.token;
            if self.is_stop_token(token) {
                break FinishReason::Stop;
            }
            sampler.accept(token);
            generated += 1;
            unfed = Some(token);

            let bytes = self.runtime.tokenizer().token_bytes(token);
            if let Some(validator) = json.as_mut() {
                validator.feed(&bytes);
            }
            text.push_str(&decoder.push(&bytes));
            token_ends.push(decoder.pending.is_empty().then_some(text.len()));
            if want_logprobs {
                let entry = self.token_logprob(&sampled, bytes);
                all_logprobs.push(entry.clone());
                unsent_logprobs.push(entry);
            }

            if let Some(stop_at) = find_stop(&text, &self.config.stop_strings) {
                stopped_at = Some(stop_at);
                text.truncate(stop_at);
                if stop_at > emitted {
                    let delta = StepDelta {
                        text: text[emitted..].to_string(),
                        logprobs: std::mem::take(&mut unsent_logprobs),
                    };
                    emitted = text.len();
                    if !on_delta(delta) {
                        break FinishReason::Abort;
                    }
                }
                break FinishReason::Stop;
            }

            let safe_end = text.len() - held_back_len(&text, &self.config.stop_strings);
            if safe_end > emitted || !unsent_logprobs.is_empty() && safe_end == text.len() {
                let delta = StepDelta {
                    text: text[emitted..safe_end].to_string(),
                    logprobs: std::mem::take(&mut unsent_logprobs),
                };
                emitted = safe_end;
                if !on_delta(delta) {
                    break FinishReason::Abort;
                }
            }

            if json.as_ref().is_some_and(JsonPrefixValidator::is_complete) {
                break FinishReason::Stop;
            }
            if generated >= max_tokens || pos + 1 >= window {
                break FinishReason::Length;
            }

            logits = self.runtime.decode_step(token, pos).await?;
            pos += 1;
            unfed = None;
            self.conversation.commit(pos);
        };

        if finish_reason == FinishReason::Abort {
            text.truncate(emitted);
        } else {
            if stopped_at.is_none() {
                text.push_str(&decoder.finish());
            }
            if text.len() > emitted || !unsent_logprobs.is_empty() {
                let delta = StepDelta {
                    text: text[emitted..].to_string(),
                    logprobs: std::mem::take(&mut unsent_logprobs),
                };
                // The reply is complete; a refusal here cannot abort anything
                on_delta(delta);
            }
        }
        let decode_secs = decode_started.elapsed().as_secs_f64();

        let mut finish_reason = finish_reason;
        let mut message = ChatMessage::assistant(text);
        if !self.config.tools.is_empty() && finish_reason == FinishReason::Stop {
            if let Some(calls) = extract_tool_calls(&message.content) {
                message.content.clear();
                message.tool_calls = calls;
                finish_reason = FinishReason::ToolCalls;
            }
        }

        if finish_reason != FinishReason::Abort {
            // Keep the KV cache in step with the reply so the next round can extend it
            if let Some(stop_at) = stopped_at {
                // Drop the tokens that spelled the stop string
                let kept = if stop_at == 0 {
                    Some(0)
                } else {
                    token_ends.iter().rposition(|end| *end == Some(stop_at)).map(|i| i + 1)
                };
                match kept {
                    Some(kept) => {
                        let end = reply_start + kept;
                        self.runtime.truncate_kv(end);
                        self.conversation.commit(end);
                        self.conversation.record_reply(message.clone());
                    }
                    None => {
                        tracing::debug!("Stop string ends inside a token, dropping conversation state");
                        self.invalidate();
                    }
                }
            } else if let Some(token) = unfed {
                if pos + 1 < window {
                    self.runtime.decode_step(token, pos).await?;
                    pos += 1;
                    self.conversation.commit(pos);
                    self.conversation.record_reply(message.clone());
                } else {
                    self.conversation.reset();
                }
            } else {
                self.conversation.record_reply(message.clone());
            }
        }

        Ok(GenerationOutcome {
            message,
            finish_reason,
            logprobs: want_logprobs.then_some(ChoiceLogprobs { content: all_logprobs }),
            prompt_tokens: prompt_tokens.len(),
            completion_tokens: generated,
            prefill_secs,
            decode_secs,
            time_to_first_token_secs: time_to_first_token.unwrap_or(0.0),
        })
    }

    fn aborted(&self, prompt_tokens: usize, started: Instant) -> GenerationOutcome {
        GenerationOutcome {
            message: ChatMessage::assistant(""),
            finish_reason: FinishReason::Abort,
            logprobs: None,
            prompt_tokens,
            completion_tokens: 0,
            prefill_secs: started.elapsed().as_secs_f64(),
            decode_secs: 0.0,
            time_to_first_token_secs: 0.0,
        }
    }

    fn is_stop_token(&self, token: TokenId) -> bool {
        self.runtime.tokenizer().is_stop_token(token) || self.template.stop_token_ids.contains(&token)
    }

    /// Tokens that keep the reply a valid JSON prefix
    fn json_mask(&self, validator: &JsonPrefixValidator, vocab: usize) -> Vec<bool> {
        let tokenizer = self.runtime.tokenizer();
        (0..vocab)
            .map(|token| {
                let token = token as TokenId;
                if tokenizer.is_stop_token(token) || self.template.stop_token_ids.contains(&token) {
                    return validator.is_complete();
                }
                let bytes = tokenizer.token_bytes(token);
                !bytes.is_empty() && validator.accepts(&bytes)
            })
            .collect()
    }

    fn token_logprob(&self, sampled: &SampledToken, bytes: Vec<u8>) -> TokenLogprob {
        let tokenizer = self.runtime.tokenizer();
        TokenLogprob {
            token: String::from_utf8_lossy(&bytes).into_owned(),
            logprob: sampled.logprob,
            bytes,
            top_logprobs: sampled
                .top
                .iter()
                .map(|(token, logprob)| TopLogprob {
                    token: String::from_utf8_lossy(&tokenizer.token_bytes(*token)).into_owned(),
                    logprob: *logprob,
                })
                .collect(),
        }
    }
}
