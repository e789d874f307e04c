use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Outbound message delivery to the end user's chat app.
pub trait MessageDispatcher: Send + Sync + 'static {
    /// Provider name (used in logs and errors).
    fn name(&self) -> &str;

    /// Send a plain text message from `device` to `recipient`.
    fn send_text(&self, device: &str, recipient: &str, text: &str) -> BoxFuture<'_, Result<()>>;

    /// Send a media message by URL.
    fn send_media(
        &self,
        device: &str,
        recipient: &str,
        url: &str,
        kind: MediaKind,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Checks that a media URL is reachable and classifies what it points at.
pub trait MediaValidator: Send + Sync + 'static {
    fn classify(&self, url: &str) -> BoxFuture<'_, Result<MediaKind>>;
}

/// Per-conversation chat log, used as AI prompt context.
pub trait ConversationHistory: Send + Sync + 'static {
    fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> BoxFuture<'_, Result<()>>;

    /// The most recent `limit` entries, oldest first.
    fn read(&self, key: &ConversationKey, limit: usize)
        -> BoxFuture<'_, Result<Vec<HistoryEntry>>>;
}

/// Text generation backend for AI prompt nodes.
///
/// Returns the raw model output; interpreting it is the engine's job.
pub trait AiGenerator: Send + Sync + 'static {
    fn generate(&self, request: AiRequest) -> BoxFuture<'_, Result<String>>;
}

/// Dynamic field-capture rules keyed by (device, stage).
pub trait FieldCaptureSource: Send + Sync + 'static {
    fn lookup(&self, device: &str, stage: &str) -> BoxFuture<'_, Result<Vec<FieldCapture>>>;
}

/// Hands a continuation to a timer that calls back no earlier than `due_at`.
pub trait DelayQueue: Send + Sync + 'static {
    fn enqueue(&self, item: DelayedContinuation) -> BoxFuture<'_, Result<()>>;
}

/// Per-conversation mutual exclusion.
pub trait SessionLock: Send + Sync + 'static {
    /// `Ok(false)` means another processor owns the conversation; not an error.
    fn acquire(&self, key: &ConversationKey) -> BoxFuture<'_, Result<bool>>;

    /// Idempotent: releasing an unheld lock succeeds.
    fn release(&self, key: &ConversationKey) -> BoxFuture<'_, Result<()>>;
}

/// Persisted execution records.
///
/// Mutations assume the caller holds the [`SessionLock`] for the conversation.
pub trait ExecutionStore: Send + Sync + 'static {
    /// The active execution for a conversation, if any.
    fn get(&self, key: &ConversationKey) -> BoxFuture<'_, Result<Option<ExecutionState>>>;

    /// Any execution by id, regardless of status.
    fn get_by_id(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionState>>>;

    /// The most recently updated execution for a conversation and flow, any status.
    fn latest(
        &self,
        key: &ConversationKey,
        flow_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionState>>>;

    /// Create the active execution at `start_node_id`, or return the one that won the race.
    fn create(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        start_node_id: &str,
    ) -> BoxFuture<'_, Result<ExecutionState>>;

    /// Move the active execution to `node_id`, inserting it on first contact.
    fn upsert_advance(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        node_id: &str,
        waiting_for_reply: bool,
    ) -> BoxFuture<'_, Result<()>>;

    /// Park or unpark the active execution without moving it.
    fn set_waiting(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        waiting_for_reply: bool,
    ) -> BoxFuture<'_, Result<()>>;

    fn set_stage(&self, execution_id: &str, stage: Option<String>) -> BoxFuture<'_, Result<()>>;

    fn save_variables(
        &self,
        execution_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Mark the active execution completed with `current_node_id = "end"`.
    fn complete(&self, key: &ConversationKey, flow_id: &str) -> BoxFuture<'_, Result<()>>;
}
