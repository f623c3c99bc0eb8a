//! Conversation templates
//!
//! Turns role-tagged messages into the prompt text a model was trained on.

use serde::{Deserialize, Serialize};

use crate::types::message::{ChatMessage, Role};
use crate::types::model::ConvTemplateConfig;

const SYSTEM_PLACEHOLDER: &str = "{system_message}";

/// Prompt layout of one model family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvTemplate {
    pub name: String,
    /// Text wrapping the system message; must contain `{system_message}`
    #[serde(default = "default_system_template")]
    pub system_template: String,
    /// Used when the conversation does not start with a system message
    #[serde(default)]
    pub system_message: String,
    pub user_role: String,
    pub assistant_role: String,
    #[serde(default = "default_tool_role")]
    pub tool_role: String,
    /// `seps[0]` closes system/user/tool turns, `seps[1]` (if any) closes
    /// assistant turns
    pub seps: Vec<String>,
    /// Between a role name and its content
    #[serde(default)]
    pub role_content_sep: String,
    /// After the assistant role name when opening a turn to generate
    #[serde(default)]
    pub role_empty_sep: String,
    #[serde(default)]
    pub stop_str: Vec<String>,
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
}

fn default_system_template() -> String {
    SYSTEM_PLACEHOLDER.to_string()
}

fn default_tool_role() -> String {
    "tool".to_string()
}

impl ConvTemplate {
    pub fn vicuna() -> Self {
        Self {
            name: "vicuna_v1.1".to_string(),
            system_template: default_system_template(),
            system_message: "A chat between a curious user and an artificial intelligence assistant. \
                The assistant gives helpful, detailed, and polite answers to the user's questions."
                .to_string(),
            user_role: "USER".to_string(),
            assistant_role: "ASSISTANT".to_string(),
            tool_role: "TOOL".to_string(),
            seps: vec![" ".to_string(), "</s>".to_string()],
            role_content_sep: ": ".to_string(),
            role_empty_sep: ":".to_string(),
            stop_str: vec!["</s>".to_string()],
            stop_token_ids: vec![2],
        }
    }

    pub fn chatml() -> Self {
        Self {
            name: "chatml".to_string(),
            system_template: format!("<|im_start|>system\n{SYSTEM_PLACEHOLDER}"),
            system_message: "You are a helpful assistant.".to_string(),
            user_role: "<|im_start|>user".to_string(),
            assistant_role: "<|im_start|>assistant".to_string(),
            tool_role: "<|im_start|>tool".to_string(),
            seps: vec!["<|im_end|>\n".to_string()],
            role_content_sep: "\n".to_string(),
            role_empty_sep: "\n".to_string(),
            stop_str: vec!["<|im_end|>".to_string()],
            stop_token_ids: Vec::new(),
        }
    }

    pub fn llama3() -> Self {
        Self {
            name: "llama-3".to_string(),
            system_template: format!(
                "<|start_header_id|>system<|end_header_id|>\n\n{SYSTEM_PLACEHOLDER}"
            ),
            system_message: "You are a helpful, respectful and honest assistant.".to_string(),
            user_role: "<|start_header_id|>user".to_string(),
            assistant_role: "<|start_header_id|>assistant".to_string(),
            tool_role: "<|start_header_id|>ipython".to_string(),
            seps: vec!["<|eot_id|>".to_string()],
            role_content_sep: "<|end_header_id|>\n\n".to_string(),
            role_empty_sep: "<|end_header_id|>\n\n".to_string(),
            stop_str: vec!["<|eot_id|>".to_string()],
            stop_token_ids: vec![128001, 128009],
        }
    }

    /// Built-in template by name
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "vicuna_v1.1" | "vicuna" | "v1" => Some(Self::vicuna()),
            "chatml" => Some(Self::chatml()),
            "llama-3" | "llama3" => Some(Self::llama3()),
            _ => None,
        }
    }

    pub fn resolve(config: &ConvTemplateConfig) -> Result<Self, String> {
        match config {
            ConvTemplateConfig::Named(name) => {
                Self::builtin(name).ok_or_else(|| format!("unknown conversation template {name:?}"))
            }
            ConvTemplateConfig::Inline(template) => {
                if !template.system_template.contains(SYSTEM_PLACEHOLDER) {
                    return Err(format!(
                        "system_template of {:?} lacks {SYSTEM_PLACEHOLDER}",
                        template.name
                    ));
                }
                if template.seps.is_empty() {
                    return Err(format!("template {:?} has no separators", template.name));
                }
                Ok((**template).clone())
            }
        }
    }

    fn role_name(&self, role: Role) -> &str {
        match role {
            Role::User | Role::System => &self.user_role,
            Role::Assistant => &self.assistant_role,
            Role::Tool => &self.tool_role,
        }
    }

    fn sep(&self, role: Role) -> &str {
        let index = usize::from(role == Role::Assistant);
        self.seps
            .get(index)
            .or_else(|| self.seps.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Render `messages[from..]` followed by the assistant generation prefix.
    ///
    /// With `from == 0` the system part is rendered too (from a leading
    /// system message, or the template default) with `tool_instructions`
    /// appended. `continues_open_turn` closes the assistant turn whose text
    /// is already in the KV cache before anything else.
    pub fn render(
        &self,
        messages: &[ChatMessage],
        from: usize,
        continues_open_turn: bool,
        tool_instructions: Option<&str>,
    ) -> String {
        let mut out = String::new();
        if continues_open_turn {
            out.push_str(self.sep(Role::Assistant));
        }

        let mut start = from;
        if from == 0 {
            let (system_message, skip) = match messages.first() {
                Some(first) if first.role == Role::System => (first.content.as_str(), 1),
                _ => (self.system_message.as_str(), 0),
            };
            let mut system_message = system_message.to_string();
            if let Some(instructions) = tool_instructions.filter(|t| !t.is_empty()) {
                if !system_message.is_empty() {
                    system_message.push_str("\n\n");
                }
                system_message.push_str(instructions);
            }
            let system = self.system_template.replace(SYSTEM_PLACEHOLDER, &system_message);
            if !system.is_empty() {
                out.push_str(&system);
                out.push_str(self.sep(Role::System));
            }
            start = skip;
        }

        for message in messages.iter().skip(start) {
            out.push_str(self.role_name(message.role));
            out.push_str(&self.role_content_sep);
            out.push_str(&message_text(message));
            out.push_str(self.sep(message.role));
        }

        out.push_str(&self.assistant_role);
        out.push_str(&self.role_empty_sep);
        out
    }
}

/// Prompt text of a message; tool calls render as the JSON the model emits
fn message_text(message: &ChatMessage) -> String {
    if message.tool_calls.is_empty() {
        return message.content.clone();
    }
    let calls: Vec<serde_json::Value> = message
        .tool_calls
        .iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(call.function.arguments.clone()));
            serde_json::json!({ "name": call.function.name, "arguments": arguments })
        })
        .collect();
    let json = serde_json::to_string(&calls).unwrap_or_default();
    if message.content.is_empty() {
        json
    } else {
        format!("{}{}", message.content, json)
    }
}
