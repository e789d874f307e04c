use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use flowbot_core::config::EngineConfig;
use flowbot_core::error::Result;
use flowbot_core::event::EventBus;
use flowbot_core::traits::{
    AiGenerator, ConversationHistory, ExecutionStore, FieldCaptureSource, MediaValidator,
    MessageDispatcher,
};
use flowbot_core::types::{
    DelayedContinuation, ExecutionState, FlowEvent, HistoryEntry, InboundMessage,
};

use crate::delay::DelayScheduler;
use crate::engine::Collaborators;
use crate::graph::FlowGraph;
use crate::handlers::Transition;

/// What the interpreter is given for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    /// The user's message, or the stored payload when a delay fires.
    pub text: String,
    pub display_name: Option<String>,
    /// The first node processed is the one the user is answering.
    pub is_reply: bool,
    /// Record `text` as the user side of the turn's first history entry.
    pub record_user: bool,
}

impl TurnInput {
    pub fn inbound(message: &InboundMessage, is_reply: bool) -> Self {
        Self {
            text: message.text.clone(),
            display_name: message.display_name.clone(),
            is_reply,
            record_user: true,
        }
    }

    /// Input for a fired delay; the payload was already logged when it arrived.
    pub fn resumed(payload: &str) -> Self {
        Self {
            text: payload.to_string(),
            display_name: None,
            is_reply: false,
            record_user: false,
        }
    }
}

/// Summary of one turn through a flow.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub execution_id: String,
    pub flow_id: String,
    /// Node ids in the order they were processed.
    pub visited: Vec<String>,
    /// Outbound messages successfully handed to the dispatcher.
    pub dispatched: usize,
    pub final_node_id: String,
    pub waiting_for_reply: bool,
    pub completed: bool,
    pub scheduled: Option<DelayedContinuation>,
    pub hop_limit_exceeded: bool,
}

impl TurnReport {
    pub fn hops(&self) -> usize {
        self.visited.len()
    }
}

/// Mutable state carried through one turn.
pub(crate) struct Turn {
    pub execution: ExecutionState,
    pub input: TurnInput,
    pub user_recorded: bool,
    pub report: TurnReport,
}

/// The flow state machine.
///
/// Walks the graph from the execution's current node, one node per hop,
/// persisting every transition. Callers must hold the conversation's
/// session lock for the whole call.
pub struct FlowInterpreter {
    pub(crate) executions: Arc<dyn ExecutionStore>,
    pub(crate) history: Arc<dyn ConversationHistory>,
    pub(crate) dispatcher: Arc<dyn MessageDispatcher>,
    pub(crate) ai: Option<Arc<dyn AiGenerator>>,
    pub(crate) media: Option<Arc<dyn MediaValidator>>,
    pub(crate) captures: Option<Arc<dyn FieldCaptureSource>>,
    pub(crate) scheduler: DelayScheduler,
    pub(crate) events: Arc<EventBus>,
    pub(crate) config: EngineConfig,
}

impl FlowInterpreter {
    pub fn new(config: EngineConfig, collaborators: &Collaborators, events: Arc<EventBus>) -> Self {
        let scheduler = DelayScheduler::new(
            collaborators.delay_queue.clone(),
            Duration::from_secs(config.default_delay_secs),
        );
        Self {
            executions: collaborators.executions.clone(),
            history: collaborators.history.clone(),
            dispatcher: collaborators.dispatcher.clone(),
            ai: collaborators.ai.clone(),
            media: collaborators.media.clone(),
            captures: collaborators.captures.clone(),
            scheduler,
            events,
            config,
        }
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    /// Run one turn starting at `execution.current_node_id`.
    ///
    /// Stops when the flow waits for a reply, hands off to a delay, ends, or
    /// exceeds `max_hops`. Hitting the hop limit is not an error: the
    /// execution stays at its last persisted node.
    pub async fn run(
        &self,
        graph: &FlowGraph,
        execution: ExecutionState,
        input: TurnInput,
    ) -> Result<TurnReport> {
        let mut turn = Turn {
            report: TurnReport {
                execution_id: execution.execution_id.clone(),
                flow_id: execution.flow_id.clone(),
                ..Default::default()
            },
            execution,
            input,
            user_recorded: false,
        };
        let key = turn.execution.key.clone();
        let flow_id = turn.execution.flow_id.clone();
        let mut reply = turn
            .input
            .is_reply
            .then(|| turn.input.text.clone());

        loop {
            let current = turn.execution.current_node_id.clone();
            if turn.report.hops() >= self.config.max_hops {
                error!(
                    phone = %key.phone,
                    device = %key.device,
                    flow_id = %flow_id,
                    node_id = %current,
                    hops = turn.report.hops(),
                    "Hop limit exceeded, stopping traversal"
                );
                self.events.publish(FlowEvent::HopLimitExceeded {
                    key: key.clone(),
                    node_id: current.clone(),
                    hops: turn.report.hops(),
                });
                turn.report.hop_limit_exceeded = true;
                break;
            }

            let node = graph.require(&current)?;
            turn.report.visited.push(node.id.clone());
            self.events.publish(FlowEvent::NodeEntered {
                key: key.clone(),
                node_id: node.id.clone(),
                kind: node.kind.to_string(),
            });
            debug!(node_id = %node.id, kind = %node.kind, "Entering node");

            // Only the first node of a reply turn sees the reply.
            let transition = self
                .step(graph, &mut turn, node, reply.take().as_deref())
                .await?;

            match transition {
                Transition::Advance(next) => {
                    self.executions
                        .upsert_advance(&key, &flow_id, &next, false)
                        .await?;
                    turn.execution.last_node_id = Some(current);
                    turn.execution.current_node_id = next;
                    turn.execution.waiting_for_reply = false;
                }
                Transition::AdvanceAndWait(next) => {
                    self.executions
                        .upsert_advance(&key, &flow_id, &next, true)
                        .await?;
                    turn.execution.last_node_id = Some(current);
                    turn.execution.current_node_id = next;
                    turn.execution.waiting_for_reply = true;
                    break;
                }
                Transition::Wait => {
                    self.executions.set_waiting(&key, &flow_id, true).await?;
                    turn.execution.waiting_for_reply = true;
                    break;
                }
                Transition::Scheduled(item) => {
                    self.events.publish(FlowEvent::DelayScheduled {
                        key: key.clone(),
                        target_node_id: item.target_node_id.clone(),
                        due_at: item.due_at,
                    });
                    turn.report.scheduled = Some(item);
                    break;
                }
                Transition::Complete => {
                    self.executions.complete(&key, &flow_id).await?;
                    turn.execution.last_node_id = Some(current);
                    turn.execution.current_node_id = "end".to_string();
                    turn.report.completed = true;
                    info!(
                        phone = %key.phone,
                        device = %key.device,
                        flow_id = %flow_id,
                        execution_id = %turn.report.execution_id,
                        "Execution completed"
                    );
                    self.events.publish(FlowEvent::ExecutionCompleted {
                        key: key.clone(),
                        execution_id: turn.report.execution_id.clone(),
                    });
                    break;
                }
            }
        }

        self.finish_history(&mut turn).await;
        turn.report.final_node_id = turn.execution.current_node_id.clone();
        turn.report.waiting_for_reply = turn.execution.waiting_for_reply;
        Ok(turn.report)
    }

    /// Append one history row for bot output sent during this turn.
    pub(crate) async fn record_history(&self, turn: &mut Turn, bot_text: &str) {
        let user_text = if turn.input.record_user && !turn.user_recorded {
            turn.input.text.clone()
        } else {
            String::new()
        };
        turn.user_recorded = true;
        self.append_history(turn, user_text, bot_text.to_string())
            .await;
    }

    /// A turn that carried input but sent nothing still logs the input.
    async fn finish_history(&self, turn: &mut Turn) {
        if turn.input.record_user && !turn.user_recorded && !turn.input.text.trim().is_empty() {
            turn.user_recorded = true;
            let user_text = turn.input.text.clone();
            self.append_history(turn, user_text, String::new()).await;
        }
    }

    async fn append_history(&self, turn: &Turn, user_text: String, bot_text: String) {
        let mut entry = HistoryEntry::new(user_text, bot_text);
        entry.stage = turn.execution.stage.clone();
        entry.display_name = turn.input.display_name.clone();
        if let Err(e) = self.history.append(&turn.execution.key, entry).await {
            warn!(key = %turn.execution.key, error = %e, "Failed to append conversation history");
        }
    }
}
