//! Function calling
//!
//! Provides tool prompt helpers and tool call parsing for replies to
//! requests that carry `tools`.

use serde_json::Value;
use uuid::Uuid;

use crate::types::message::{FunctionCall, ToolCall};
use crate::types::openai::{ChatTool, ToolChoice};

pub fn build_tool_instructions(tools: &[ChatTool], choice: Option<&ToolChoice>) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut out = String::from(
        "# Tools\n\
If you need to call a function, respond ONLY with a JSON array in this format:\n\
[{\"name\":\"function_name\",\"arguments\":{...}}]\n\
Do not add any extra text.\n",
    );
    if let Some(ToolChoice::Named(named)) = choice {
        out.push_str("You must call the function ");
        out.push_str(&named.function.name);
        out.push_str(".\n");
    }
    out.push_str("\nAvailable functions:\n");

    for tool in tools {
        let schema = serde_json::to_string(&tool.function.parameters).unwrap_or_else(|_| "{}".to_string());
        out.push_str("- ");
        out.push_str(&tool.function.name);
        if !tool.function.description.is_empty() {
            out.push_str(": ");
            out.push_str(&tool.function.description);
        }
        out.push_str("\n  parameters: ");
        out.push_str(&schema);
        out.push('\n');
    }

    out
}

/// Parse the tool calls in a reply, if the reply is one
pub fn extract_tool_calls(text: &str) -> Option<Vec<ToolCall>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(calls) = parse_tool_calls_json(trimmed) {
        return Some(calls);
    }

    if let Some(code_block) = extract_code_block(trimmed) {
        if let Some(calls) = parse_tool_calls_json(code_block.trim()) {
            return Some(calls);
        }
    }

    None
}

fn parse_tool_calls_json(input: &str) -> Option<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(input).ok()?;
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return None,
    };
    if items.is_empty() {
        return None;
    }

    items
        .iter()
        .map(|item| {
            let obj = item.as_object()?;
            let name = obj
                .get("name")
                .or_else(|| obj.get("tool"))
                .and_then(|v| v.as_str())?
                .to_string();
            let arguments = obj
                .get("arguments")
                .or_else(|| obj.get("parameters"))
                .or_else(|| obj.get("params"))
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            let arguments = match arguments {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some(ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                kind: "function".to_string(),
                function: FunctionCall { name, arguments },
            })
        })
        .collect()
}

fn extract_code_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let after_lang = if let Some(newline) = rest.find('\n') {
        &rest[newline + 1..]
    } else {
        rest
    };
    let end = after_lang.find("```")?;
    Some(&after_lang[..end])
}
