//! Configuration types
//!
//! Application and per-model chat configuration structures.

use serde::{Deserialize, Serialize};

use crate::inference::template::ConvTemplate;
use crate::types::model::ModelRecord;

/// Storage strategy behind the artifact cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Quota-managed blob store with an index and ranged reads
    #[default]
    BlobStore,
    /// Simple request/response cache, one self-describing file per entry
    RequestCache,
}

/// Application configuration: what can be loaded and where it is cached
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Models the engine is allowed to load
    #[serde(default)]
    pub model_list: Vec<ModelRecord>,
    /// Cache backend used for model artifacts
    #[serde(default)]
    pub cache_backend: CacheBackendKind,
}

impl AppConfig {
    /// Look up a model record by id
    pub fn find_model(&self, model_id: &str) -> Option<&ModelRecord> {
        self.model_list.iter().find(|m| m.model_id == model_id)
    }
}

/// Per-model overrides passed to `reload`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv_template: Option<ConvTemplate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.model_list.is_empty());
        assert_eq!(config.cache_backend, CacheBackendKind::BlobStore);
    }

    #[test]
    fn test_config_serialization() {
        let json = r#"{
            "model_list": [{
                "model_id": "tiny",
                "model_url": "https://example.com/tiny/",
                "model_lib": "https://example.com/tiny.wasm",
                "required_features": ["shader-f16"]
            }],
            "cache_backend": "request_cache"
        }"#;
        let config: AppConfig = serde_json::from_str(json).expect("Failed to deserialize");
        assert_eq!(config.cache_backend, CacheBackendKind::RequestCache);
        let record = config.find_model("tiny").expect("model listed");
        assert_eq!(record.required_features, vec!["shader-f16".to_string()]);
        assert!(config.find_model("other").is_none());
    }
}
