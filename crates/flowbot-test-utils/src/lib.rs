//! Test doubles for the engine's collaborators, plus a small flow builder.

mod doubles;
mod flow;

pub use doubles::{
    MemoryHistory, RecordingDelayQueue, RecordingDispatcher, ScriptedAi, Sent,
    StaticMediaValidator,
};
pub use flow::FlowBuilder;

/// A conversation key for tests.
pub fn key(phone: &str) -> flowbot_core::types::ConversationKey {
    flowbot_core::types::ConversationKey::new(phone, "test-device")
}
