//! Model types
//!
//! Defines model records (what can be loaded) and the per-model chat config
//! shipped next to the weights.

use serde::{Deserialize, Serialize};

use crate::inference::template::ConvTemplate;

/// A loadable model, as listed in the app config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Unique logical id
    pub model_id: String,
    /// Base URL of the config, tokenizer and weight manifest
    pub model_url: String,
    /// URL of the compiled kernel library
    pub model_lib: String,
    /// Accelerator features the kernels rely on (e.g. `shader-f16`)
    #[serde(default)]
    pub required_features: Vec<String>,
    /// Approximate accelerator memory needed, in MB
    #[serde(default)]
    pub vram_required_mb: Option<f64>,
    /// Whether the model targets low-resource devices
    #[serde(default)]
    pub low_resource_required: bool,
    /// Quantization scheme label (e.g. `q4f16_1`)
    #[serde(default)]
    pub quantization: Option<String>,
    /// Context window override; takes precedence over the chat config
    #[serde(default)]
    pub context_window_size: Option<usize>,
}

impl ModelRecord {
    /// File name of the kernel library, taken from the last URL segment
    pub fn model_lib_file(&self) -> &str {
        let trimmed = self.model_lib.split(['?', '#']).next().unwrap_or(&self.model_lib);
        trimmed
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("model_lib.wasm")
    }
}

/// Conversation template reference: either a built-in name or an inline template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConvTemplateConfig {
    Named(String),
    Inline(Box<ConvTemplate>),
}

impl Default for ConvTemplateConfig {
    fn default() -> Self {
        ConvTemplateConfig::Named("chatml".to_string())
    }
}

/// Chat config shipped with the weights (`mlc-chat-config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub conv_template: ConvTemplateConfig,
    #[serde(default = "default_context_window")]
    pub context_window_size: usize,
    /// Maximum tokens per prefill forward pass (`None` = whole prompt at once)
    #[serde(default)]
    pub prefill_chunk_size: Option<usize>,
    #[serde(default = "default_tokenizer_files")]
    pub tokenizer_files: Vec<String>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
}

fn default_context_window() -> usize {
    4096
}

fn default_tokenizer_files() -> Vec<String> {
    vec!["tokenizer.json".to_string()]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conv_template: ConvTemplateConfig::default(),
            context_window_size: default_context_window(),
            prefill_chunk_size: None,
            tokenizer_files: default_tokenizer_files(),
            vocab_size: None,
            temperature: None,
            top_p: None,
            repetition_penalty: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }
}
