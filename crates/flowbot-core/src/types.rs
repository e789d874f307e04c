use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Identifies one chat session: the end user's phone number on one device.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationKey {
    pub phone: String,
    pub device: String,
}

impl ConversationKey {
    pub fn new(phone: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            device: device.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.phone, self.device)
    }
}

// ── Flow definitions ────────────────────────────────────────────

/// The closed set of node kinds a flow may contain.
///
/// Authoring tools are not consistent about spelling, so parsing is
/// case-insensitive and treats `-` like `_`. Anything unrecognised is kept
/// as `Unknown` and interpreted as a passthrough.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    Message,
    Image,
    Audio,
    Video,
    Stage,
    Delay,
    Condition,
    UserReply,
    WaitingReplyTimes,
    AiPrompt,
    AdvancedAiPrompt,
    Prompt,
    Manual,
    End,
    Unknown(String),
}

impl NodeKind {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "start" => Self::Start,
            "message" | "text" => Self::Message,
            "image" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "stage" => Self::Stage,
            "delay" => Self::Delay,
            "condition" => Self::Condition,
            "user_reply" | "userreply" => Self::UserReply,
            "waiting_reply_times" => Self::WaitingReplyTimes,
            "ai_prompt" | "aiprompt" => Self::AiPrompt,
            "advanced_ai_prompt" => Self::AdvancedAiPrompt,
            "prompt" => Self::Prompt,
            "manual" => Self::Manual,
            "end" => Self::End,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Message => "message",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Stage => "stage",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::UserReply => "user_reply",
            Self::WaitingReplyTimes => "waiting_reply_times",
            Self::AiPrompt => "ai_prompt",
            Self::AdvancedAiPrompt => "advanced_ai_prompt",
            Self::Prompt => "prompt",
            Self::Manual => "manual",
            Self::End => "end",
            Self::Unknown(raw) => raw,
        }
    }

    /// Nodes that park the conversation until the user answers.
    pub fn awaits_reply(&self) -> bool {
        matches!(self, Self::UserReply | Self::WaitingReplyTimes)
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Self::AiPrompt | Self::AdvancedAiPrompt | Self::Prompt)
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            Self::Image => Some(MediaKind::Image),
            Self::Audio => Some(MediaKind::Audio),
            Self::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl From<String> for NodeKind {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Free-form node payload as produced by the flow builder.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            data: serde_json::Map::new(),
        }
    }

    /// Attach a data field.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// First non-empty string found under any of `keys`.
    pub fn data_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.data.get(*k))
            .filter_map(|v| v.as_str())
            .find(|s| !s.trim().is_empty())
    }

    /// First value under any of `keys` that reads as a number (JSON number or numeric string).
    pub fn data_f64(&self, keys: &[&str]) -> Option<f64> {
        keys.iter()
            .filter_map(|k| self.data.get(*k))
            .find_map(|v| match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
    }
}

/// A directed, optionally handle-labelled connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(
        default,
        rename = "sourceHandle",
        alias = "source_handle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(
        source: impl Into<String>,
        target: impl Into<String>,
        handle: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: Some(handle.into()),
        }
    }
}

/// A scripted conversation: nodes plus the edges between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

// ── Conditions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    #[serde(alias = "equal", alias = "eq")]
    Equals,
    Contains,
    #[serde(alias = "notEquals", alias = "not_equal", alias = "neq")]
    NotEquals,
    #[serde(alias = "startsWith")]
    StartsWith,
    #[serde(alias = "endsWith")]
    EndsWith,
    #[serde(alias = "else", alias = "fallback")]
    Default,
    #[serde(other)]
    Unsupported,
}

/// One branch of a `condition` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    #[serde(rename = "type", default = "default_condition_kind")]
    pub kind: ConditionKind,
    /// Comma-separated match tokens.
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn default_condition_kind() -> ConditionKind {
    ConditionKind::Equals
}

impl ConditionSpec {
    pub fn new(kind: ConditionKind, value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            label: label.into(),
            id: None,
        }
    }

    /// Non-empty, trimmed, uppercased tokens of `value`.
    pub fn tokens(&self) -> Vec<String> {
        self.value
            .split(',')
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Accept strings, numbers, and booleans where a string is expected.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ── Execution state ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Active,
    Completed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            _ => Self::Active,
        }
    }
}

/// Persisted progress of one conversation through one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub flow_id: String,
    pub key: ConversationKey,
    pub current_node_id: String,
    #[serde(default)]
    pub last_node_id: Option<String>,
    pub waiting_for_reply: bool,
    /// `None` means no stage recorded yet; `Some("")` is an explicitly empty stage.
    #[serde(default)]
    pub stage: Option<String>,
    pub status: ExecutionStatus,
    /// Business fields captured along the way, usable as `{{name}}` in templates.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(flow_id: impl Into<String>, key: ConversationKey, start_node: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            key,
            current_node_id: start_node.into(),
            last_node_id: None,
            waiting_for_reply: false,
            stage: None,
            status: ExecutionStatus::Active,
            variables: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ExecutionStatus::Active
    }
}

/// "Resume this conversation at `target_node_id` once `due_at` has passed."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedContinuation {
    pub execution_id: String,
    pub flow_id: String,
    pub target_node_id: String,
    pub key: ConversationKey,
    /// The user input that was being processed when the delay was hit.
    pub payload: String,
    pub due_at: DateTime<Utc>,
    /// Delivery attempts so far (re-enqueues after a busy lock bump this).
    #[serde(default)]
    pub attempt: u32,
}

// ── Conversation history ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_text: String,
    pub bot_text: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(user_text: impl Into<String>, bot_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            bot_text: bot_text.into(),
            stage: None,
            display_name: None,
            timestamp: Utc::now(),
        }
    }
}

// ── Field capture ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureInput {
    UserInput,
    Fixed,
}

impl CaptureInput {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Self::Fixed,
            _ => Self::UserInput,
        }
    }
}

/// A rule copying user input or a fixed value into a business field when a
/// conversation reaches a given stage on a given device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCapture {
    pub input_kind: CaptureInput,
    #[serde(default)]
    pub fixed_value: Option<String>,
    pub target_field: String,
}

// ── Media ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" | "voice" => Some(Self::Audio),
            _ => None,
        }
    }
}

// ── Ingress / AI ────────────────────────────────────────────────

/// One inbound end-user message as delivered by the webhook layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: ConversationKey,
    pub text: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(key: ConversationKey, text: impl Into<String>) -> Self {
        Self {
            key,
            text: text.into(),
            display_name: None,
            received_at: Utc::now(),
        }
    }
}

/// Everything the AI collaborator needs to produce one reply.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub system_prompt: String,
    pub user_input: String,
    pub api_key: Option<String>,
    pub device_id: String,
    pub history: Vec<HistoryEntry>,
}

// ── Events ──────────────────────────────────────────────────────

/// Events emitted by the engine during processing.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    InboundAccepted {
        key: ConversationKey,
        flow_id: String,
        execution_id: String,
    },
    Skipped {
        key: ConversationKey,
        reason: String,
    },
    NodeEntered {
        key: ConversationKey,
        node_id: String,
        kind: String,
    },
    MessageDispatched {
        key: ConversationKey,
        node_id: String,
        kind: String,
    },
    DispatchFailed {
        key: ConversationKey,
        node_id: String,
        error: String,
    },
    DelayScheduled {
        key: ConversationKey,
        target_node_id: String,
        due_at: DateTime<Utc>,
    },
    ContinuationResumed {
        key: ConversationKey,
        target_node_id: String,
    },
    ExecutionCompleted {
        key: ConversationKey,
        execution_id: String,
    },
    HopLimitExceeded {
        key: ConversationKey,
        node_id: String,
        hops: usize,
    },
}
