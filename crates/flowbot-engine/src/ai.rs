//! The JSON contract AI prompt nodes expect back from the generator:
//! `{"Stage": "...", "Response": [{"type": "text", "content": "..."}]}`.

use serde_json::Value;

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::types::{FlowNode, MediaKind, NodeKind};

use crate::template::TemplateContext;

/// A parsed generator reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AiReply {
    /// `None` when the reply did not set a stage (or set it to "").
    pub stage: Option<String>,
    pub items: Vec<AiItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiItem {
    pub kind: AiItemKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiItemKind {
    Text,
    /// Media by URL; `None` means the kind is left to the media validator.
    Media(Option<MediaKind>),
}

/// Interpret raw generator output.
///
/// Accepts the object bare, inside a ```json fence, or surrounded by prose.
pub fn parse_ai_reply(raw: &str) -> Result<AiReply> {
    let body = extract_json(raw)
        .ok_or_else(|| FlowbotError::AiParse("no JSON object in reply".to_string()))?;
    let value: Value =
        serde_json::from_str(body).map_err(|e| FlowbotError::AiParse(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| FlowbotError::AiParse("reply is not a JSON object".to_string()))?;

    let stage = field(object, &["Stage", "stage"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let response = field(object, &["Response", "response"])
        .ok_or_else(|| FlowbotError::AiParse("missing Response".to_string()))?;

    let items = match response {
        Value::Array(entries) => entries.iter().filter_map(parse_item).collect(),
        Value::String(text) => vec![AiItem {
            kind: AiItemKind::Text,
            content: text.clone(),
        }],
        single @ Value::Object(_) => parse_item(single).into_iter().collect(),
        other => {
            return Err(FlowbotError::AiParse(format!(
                "Response has unexpected shape: {}",
                other
            )))
        }
    };

    Ok(AiReply { stage, items })
}

fn field<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| object.get(*k))
}

fn parse_item(value: &Value) -> Option<AiItem> {
    if let Value::String(text) = value {
        return Some(AiItem {
            kind: AiItemKind::Text,
            content: text.clone(),
        });
    }
    let object = value.as_object()?;
    let content = field(object, &["content", "Content"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let kind_str = field(object, &["type", "Type"])
        .and_then(Value::as_str)
        .unwrap_or("text")
        .trim()
        .to_ascii_lowercase();
    let jenis = field(object, &["Jenis", "jenis"])
        .and_then(Value::as_str)
        .and_then(MediaKind::parse);

    let kind = match kind_str.as_str() {
        "image" | "video" | "audio" => AiItemKind::Media(MediaKind::parse(&kind_str)),
        "media" | "file" => AiItemKind::Media(jenis),
        _ => AiItemKind::Text,
    };
    Some(AiItem { kind, content })
}

/// The outermost `{...}` of `raw`, after stripping a code fence if present.
fn extract_json(raw: &str) -> Option<&str> {
    let mut text = raw.trim();
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    }
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    (close > open).then(|| &text[open..=close])
}

const REPLY_FORMAT: &str = "Reply with a single JSON object and nothing else: \
{\"Stage\": \"<stage name or empty>\", \"Response\": [{\"type\": \"text\", \"content\": \"...\"}]}. \
Use type \"image\", \"video\" or \"audio\" with a URL as content to send media.";

/// Build the system prompt for an AI node.
///
/// `advanced_ai_prompt` nodes may also carry reference material
/// (`knowledge`/`context`) which is appended under its own heading.
pub fn compose_system_prompt(node: &FlowNode, ctx: &TemplateContext<'_>) -> String {
    let base = node
        .data_str(&["prompt", "systemPrompt", "system_prompt", "text"])
        .unwrap_or("You are a helpful assistant.");
    let mut prompt = ctx.render(base);

    if node.kind == NodeKind::AdvancedAiPrompt {
        if let Some(reference) = node.data_str(&["knowledge", "context"]) {
            prompt.push_str("\n\nReference:\n");
            prompt.push_str(&ctx.render(reference));
        }
    }

    prompt.push_str("\n\nCurrent stage: ");
    prompt.push_str(ctx.stage.filter(|s| !s.is_empty()).unwrap_or("none"));
    prompt.push_str("\n\n");
    prompt.push_str(REPLY_FORMAT);
    prompt
}

/// Per-node API key override.
pub fn node_api_key(node: &FlowNode) -> Option<String> {
    node.data_str(&["apiKey", "api_key"]).map(String::from)
}
