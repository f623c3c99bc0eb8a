//! OpenAI-compatible chat completion schema
//!
//! Request and response payloads for `chat_completion`, in the widely used
//! JSON shape so application code can talk to the engine like any hosted API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::message::{ChatMessage, Role, ToolCall};

/// Upper bound for `top_logprobs`
pub const MAX_TOP_LOGPROBS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// `stop` accepts a single string or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatKind {
    #[default]
    Text,
    JsonObject,
    Grammar,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type", default)]
    pub kind: ResponseFormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,
    pub function: NamedFunction,
}

/// `tool_choice`: `"none"`, `"auto"`, or a specific function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

/// Chat completion request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Target model; required when several models are loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    /// Generation length cap
    #[serde(default, alias = "max_gen_len", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Token id (as string) -> bias added to its logit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(default)]
    pub logprobs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

impl ChatCompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn choices(&self) -> usize {
        self.n.unwrap_or(1)
    }

    pub fn json_mode(&self) -> bool {
        matches!(
            self.response_format.as_ref().map(|f| f.kind),
            Some(ResponseFormatKind::JsonObject)
        )
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.as_ref().map(|o| o.include_usage).unwrap_or(false)
    }

    /// Tools that should be offered to the model, honoring `tool_choice`
    pub fn active_tools(&self) -> Vec<ChatTool> {
        let tools = self.tools.clone().unwrap_or_default();
        match &self.tool_choice {
            Some(ToolChoice::Mode(mode)) if mode == "none" => Vec::new(),
            Some(ToolChoice::Named(named)) => tools
                .into_iter()
                .filter(|t| t.function.name == named.function.name)
                .collect(),
            _ => tools,
        }
    }

    /// Structural validation, independent of any loaded model
    pub fn validate(&self) -> Result<(), String> {
        let last = self
            .messages
            .last()
            .ok_or_else(|| "messages must not be empty".to_string())?;
        if !matches!(last.role, Role::User | Role::Tool) {
            return Err(format!(
                "the last message must come from the user or a tool, got {}",
                last.role
            ));
        }
        if let Some(pos) = self
            .messages
            .iter()
            .skip(1)
            .position(|m| m.role == Role::System)
        {
            return Err(format!(
                "system message must be the first message, found one at index {}",
                pos + 1
            ));
        }

        let n = self.choices();
        if n == 0 {
            return Err("n must be at least 1".to_string());
        }
        if n > 1 && self.stream {
            return Err("n > 1 is not supported for streaming requests".to_string());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature must be within [0, 2], got {t}"));
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(format!("top_p must be within (0, 1], got {p}"));
            }
        }
        for (name, value) in [
            ("presence_penalty", self.presence_penalty),
            ("frequency_penalty", self.frequency_penalty),
        ] {
            if let Some(v) = value {
                if !(-2.0..=2.0).contains(&v) {
                    return Err(format!("{name} must be within [-2, 2], got {v}"));
                }
            }
        }
        if let Some(r) = self.repetition_penalty {
            if r <= 0.0 {
                return Err(format!("repetition_penalty must be positive, got {r}"));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err("max_tokens must be at least 1".to_string());
            }
        }
        if let Some(top) = self.top_logprobs {
            if !self.logprobs {
                return Err("top_logprobs requires logprobs to be true".to_string());
            }
            if top > MAX_TOP_LOGPROBS {
                return Err(format!("top_logprobs must be at most {MAX_TOP_LOGPROBS}"));
            }
        }
        if let Some(bias) = &self.logit_bias {
            if let Some(bad) = bias.keys().find(|k| k.parse::<u32>().is_err()) {
                return Err(format!("logit_bias keys must be token ids, got {bad:?}"));
            }
            if let Some((token, value)) = bias.iter().find(|(_, v)| !(-100.0..=100.0).contains(*v)) {
                return Err(format!("logit_bias for token {token} must be within [-100, 100], got {value}"));
            }
        }
        if let Some(format) = &self.response_format {
            if format.kind == ResponseFormatKind::Grammar {
                return Err("grammar response formats are not supported".to_string());
            }
        }
        if self.json_mode() && self.tools.as_ref().is_some_and(|t| !t.is_empty()) {
            return Err("json_object response format cannot be combined with tools".to_string());
        }
        match &self.tool_choice {
            Some(_) if self.tools.as_ref().map_or(true, |t| t.is_empty()) => {
                return Err("tool_choice requires tools".to_string());
            }
            Some(ToolChoice::Mode(mode)) if !matches!(mode.as_str(), "none" | "auto") => {
                return Err(format!("unknown tool_choice {mode:?}"));
            }
            Some(ToolChoice::Named(named))
                if !self
                    .tools
                    .iter()
                    .flatten()
                    .any(|t| t.function.name == named.function.name) =>
            {
                return Err(format!("tool_choice names unknown function {}", named.function.name));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Abort,
    ToolCalls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLogprob {
    pub token: String,
    pub logprob: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f32,
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceLogprobs {
    pub content: Vec<TokenLogprob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageExtra {
    pub prefill_tokens_per_s: f64,
    pub decode_tokens_per_s: f64,
    pub time_to_first_token_s: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    #[serde(default)]
    pub extra: UsageExtra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChoiceLogprobs>,
}

/// Non-streaming chat completion result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChoiceLogprobs>,
}

/// One streamed increment of a chat completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest::new(messages)
    }

    #[test]
    fn test_parse_openai_request() {
        let json = r#"{
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "Provide me three US states."}
            ],
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_gen_len": 64,
            "stop": "\n\n",
            "response_format": {"type": "json_object"}
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert!(req.stream);
        assert!(req.include_usage());
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.stop.as_ref().unwrap().to_vec(), vec!["\n\n".to_string()]);
        assert!(req.json_mode());
    }

    #[test]
    fn test_validate_last_message_role() {
        let req = request(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);
        assert!(req.validate().unwrap_err().contains("last message"));
        assert!(request(vec![]).validate().is_err());
    }

    #[test]
    fn test_validate_system_position() {
        let req = request(vec![ChatMessage::user("hi"), ChatMessage::system("late"), ChatMessage::user("?")]);
        assert!(req.validate().unwrap_err().contains("system message"));
    }

    #[test]
    fn test_validate_sampling_ranges() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.temperature = Some(3.0);
        assert!(req.validate().is_err());
        req.temperature = Some(0.0);
        req.top_logprobs = Some(2);
        assert!(req.validate().is_err());
        req.logprobs = true;
        assert!(req.validate().is_ok());
        req.top_logprobs = Some(9);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_logit_bias_range() {
        let mut req: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"hi"}],"logit_bias":{"65":1e39}}"#,
        )
        .unwrap();
        let err = req.validate().unwrap_err();
        assert!(err.contains("logit_bias"), "{err}");

        req.logit_bias = Some(HashMap::from([("65".to_string(), -100.0)]));
        assert!(req.validate().is_ok());
        req.logit_bias = Some(HashMap::from([("65".to_string(), f32::NAN)]));
        assert!(req.validate().is_err());
        req.logit_bias = Some(HashMap::from([("65".to_string(), 100.5)]));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_streaming_n() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.n = Some(2);
        assert!(req.validate().is_ok());
        req.stream = true;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_tool_choice_filters_tools() {
        let tool = |name: &str| ChatTool {
            kind: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: String::new(),
                parameters: Value::Null,
            },
        };
        let mut req = request(vec![ChatMessage::user("weather?")]);
        req.tools = Some(vec![tool("get_weather"), tool("get_time")]);
        assert_eq!(req.active_tools().len(), 2);

        req.tool_choice = Some(ToolChoice::Named(NamedToolChoice {
            kind: "function".into(),
            function: NamedFunction { name: "get_time".into() },
        }));
        assert!(req.validate().is_ok());
        let active = req.active_tools();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].function.name, "get_time");

        req.tool_choice = Some(ToolChoice::Mode("none".into()));
        assert!(req.active_tools().is_empty());
    }

    #[test]
    fn test_finish_reason_serialization() {
        assert_eq!(serde_json::to_string(&FinishReason::ToolCalls).unwrap(), "\"tool_calls\"");
        assert_eq!(serde_json::to_string(&FinishReason::Abort).unwrap(), "\"abort\"");
    }
}
