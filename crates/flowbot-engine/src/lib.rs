//! The conversation engine.
//!
//! A flow is a directed graph of nodes. Each inbound message (or fired
//! delay) moves one conversation's persisted execution through that graph
//! until it has to wait: for a user reply, for a timer, or because the flow
//! ended. All of that happens while the conversation's session lock is held.

pub mod ai;
pub mod condition;
pub mod delay;
pub mod engine;
pub mod flows;
pub mod graph;
mod handlers;
pub mod interpreter;
pub mod template;

pub use delay::{DelayScheduler, TokioDelayQueue};
pub use engine::{Collaborators, FlowEngine, ProcessOutcome, ResumeOutcome, SkipReason};
pub use flows::{FileFlowSource, FlowSource, StaticFlowSource};
pub use graph::FlowGraph;
pub use interpreter::{FlowInterpreter, TurnInput, TurnReport};
