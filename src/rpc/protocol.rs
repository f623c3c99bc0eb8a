//! Wire messages exchanged between an engine client and its worker

use serde::{Deserialize, Serialize};

use crate::inference::engine::EngineError;
use crate::storage::artifact_cache::ArtifactKind;
use crate::types::config::ChatOptions;
use crate::types::openai::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest};
use crate::types::progress::ProgressReport;

/// Correlates a request with its replies
pub type RequestId = u64;

/// One call on the engine API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum EngineRequest {
    Reload {
        model_ids: Vec<String>,
        #[serde(default)]
        chat_options: Vec<ChatOptions>,
    },
    ChatCompletion(ChatCompletionRequest),
    GetMessage {
        #[serde(default)]
        model: Option<String>,
    },
    Unload {
        #[serde(default)]
        model: Option<String>,
    },
    Interrupt {
        #[serde(default)]
        model: Option<String>,
    },
    ResetChat {
        #[serde(default)]
        model: Option<String>,
    },
    RuntimeStatsText {
        #[serde(default)]
        model: Option<String>,
    },
    HasModelInCache {
        model_id: String,
    },
    DeleteModelAllInfoInCache {
        model_id: String,
    },
    DeleteModelArtifact {
        model_id: String,
        kind: ArtifactKind,
    },
    /// Keep-alive; answered with [`ResponsePayload::Unit`]
    Heartbeat,
}

impl EngineRequest {
    pub fn method(&self) -> &'static str {
        match self {
            EngineRequest::Reload { .. } => "reload",
            EngineRequest::ChatCompletion(_) => "chat_completion",
            EngineRequest::GetMessage { .. } => "get_message",
            EngineRequest::Unload { .. } => "unload",
            EngineRequest::Interrupt { .. } => "interrupt",
            EngineRequest::ResetChat { .. } => "reset_chat",
            EngineRequest::RuntimeStatsText { .. } => "runtime_stats_text",
            EngineRequest::HasModelInCache { .. } => "has_model_in_cache",
            EngineRequest::DeleteModelAllInfoInCache { .. } => "delete_model_all_info_in_cache",
            EngineRequest::DeleteModelArtifact { .. } => "delete_model_artifact",
            EngineRequest::Heartbeat => "heartbeat",
        }
    }
}

/// Result of a non-streaming call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponsePayload {
    Unit,
    Bool(bool),
    Text(String),
    Completion(ChatCompletion),
}

impl ResponsePayload {
    fn kind(&self) -> &'static str {
        match self {
            ResponsePayload::Unit => "unit",
            ResponsePayload::Bool(_) => "bool",
            ResponsePayload::Text(_) => "text",
            ResponsePayload::Completion(_) => "completion",
        }
    }

    fn mismatch(&self, expected: &str) -> EngineError {
        EngineError::Channel(format!("expected a {expected} response, got {}", self.kind()))
    }

    pub fn into_unit(self) -> Result<(), EngineError> {
        match self {
            ResponsePayload::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    pub fn into_bool(self) -> Result<bool, EngineError> {
        match self {
            ResponsePayload::Bool(value) => Ok(value),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn into_text(self) -> Result<String, EngineError> {
        match self {
            ResponsePayload::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn into_completion(self) -> Result<ChatCompletion, EngineError> {
        match self {
            ResponsePayload::Completion(completion) => Ok(completion),
            other => Err(other.mismatch("completion")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker accepts requests from now on
    Ready,
    Request { id: RequestId, request: EngineRequest },
    Response { id: RequestId, result: ResponsePayload },
    Chunk { id: RequestId, chunk: ChatCompletionChunk },
    /// End of a chunk stream
    Done { id: RequestId },
    Error { id: RequestId, error: EngineError },
    Progress { report: ProgressReport },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let msg = WorkerMessage::Request {
            id: 7,
            request: EngineRequest::DeleteModelArtifact {
                model_id: "m".into(),
                kind: ArtifactKind::Weights,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["id"], 7);
        assert_eq!(json["request"]["method"], "delete_model_artifact");
        assert_eq!(json["request"]["params"]["kind"], "weights");

        let back: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_parse_request_with_defaults() {
        let msg: WorkerMessage = serde_json::from_str(
            r#"{"kind": "request", "id": 1, "request": {"method": "reload", "params": {"model_ids": ["a"]}}}"#,
        )
        .unwrap();
        match msg {
            WorkerMessage::Request {
                request: EngineRequest::Reload { model_ids, chat_options },
                ..
            } => {
                assert_eq!(model_ids, vec!["a".to_string()]);
                assert!(chat_options.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let heartbeat: EngineRequest = serde_json::from_str(r#"{"method": "heartbeat"}"#).unwrap();
        assert_eq!(heartbeat.method(), "heartbeat");
    }

    #[test]
    fn test_error_message_keeps_error_kind() {
        let msg = WorkerMessage::Error {
            id: 3,
            error: EngineError::AmbiguousModel {
                loaded: vec!["a".into(), "b".into()],
            },
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: WorkerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_payload_mismatch() {
        assert!(ResponsePayload::Bool(true).into_bool().unwrap());
        let err = ResponsePayload::Unit.into_text().unwrap_err();
        assert!(matches!(err, EngineError::Channel(_)));
    }
}
