use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowbot_core::config::EngineConfig;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::event::EventBus;
use flowbot_core::traits::{
    AiGenerator, ConversationHistory, DelayQueue, ExecutionStore, FieldCaptureSource,
    MediaValidator, MessageDispatcher, SessionLock,
};
use flowbot_core::types::{
    ConversationKey, DelayedContinuation, ExecutionState, FlowEvent, InboundMessage, NodeKind,
};

use crate::flows::FlowSource;
use crate::graph::FlowGraph;
use crate::interpreter::{FlowInterpreter, TurnInput, TurnReport};

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub flows: Arc<dyn FlowSource>,
    pub lock: Arc<dyn SessionLock>,
    pub executions: Arc<dyn ExecutionStore>,
    pub history: Arc<dyn ConversationHistory>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub delay_queue: Arc<dyn DelayQueue>,
    pub ai: Option<Arc<dyn AiGenerator>>,
    pub media: Option<Arc<dyn MediaValidator>>,
    pub captures: Option<Arc<dyn FieldCaptureSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another processor holds the conversation lock.
    Busy,
    /// The conversation is parked on a delay whose continuation has not fired.
    DelayPending,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::DelayPending => "delay_pending",
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Processed(TurnReport),
    Skipped(SkipReason),
    /// No active execution and no flow bound to the device.
    NoFlow,
    /// Processing started but failed; the execution stays at its last persisted node.
    Failed(String),
}

/// Result of delivering one delayed continuation.
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    Resumed(TurnReport),
    /// The execution already moved past the delay (duplicate delivery).
    Stale,
    /// The conversation lock is held; retry later.
    Busy,
    /// No execution exists for the continuation.
    Missing,
}

/// Entry point for inbound messages and fired delays.
///
/// Every call takes the conversation's session lock for its full duration
/// and always releases it, including when interpretation panics.
pub struct FlowEngine {
    interpreter: FlowInterpreter,
    flows: Arc<dyn FlowSource>,
    lock: Arc<dyn SessionLock>,
    executions: Arc<dyn ExecutionStore>,
    delay_queue: Arc<dyn DelayQueue>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators, events: Arc<EventBus>) -> Self {
        let interpreter = FlowInterpreter::new(config.clone(), &collaborators, events.clone());
        Self {
            interpreter,
            flows: collaborators.flows,
            lock: collaborators.lock,
            executions: collaborators.executions,
            delay_queue: collaborators.delay_queue,
            events,
            config,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process one inbound message.
    ///
    /// `Err` is returned only when the lock itself could not be consulted;
    /// anything that goes wrong after the lock is taken becomes
    /// [`ProcessOutcome::Failed`] so callers do not retry a half-processed
    /// message.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<ProcessOutcome> {
        let key = &message.key;
        if !self.lock.acquire(key).await? {
            debug!(phone = %key.phone, device = %key.device, "Conversation busy, dropping message");
            self.skipped(key, SkipReason::Busy);
            return Ok(ProcessOutcome::Skipped(SkipReason::Busy));
        }

        let result = AssertUnwindSafe(self.process_inbound(message))
            .catch_unwind()
            .await;
        self.release(key).await;

        Ok(match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(phone = %key.phone, device = %key.device, error = %e, "Inbound processing failed");
                ProcessOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic);
                error!(phone = %key.phone, device = %key.device, panic = %reason, "Inbound processing panicked");
                ProcessOutcome::Failed(reason)
            }
        })
    }

    /// Deliver a fired delay: move the execution to the target node and
    /// continue the flow with the stored payload.
    ///
    /// Safe to call more than once for the same item; only a call that finds
    /// the execution still parked on the delay node does anything.
    pub async fn resume(&self, item: &DelayedContinuation) -> Result<ResumeOutcome> {
        if !self.lock.acquire(&item.key).await? {
            debug!(execution_id = %item.execution_id, "Conversation busy, continuation deferred");
            return Ok(ResumeOutcome::Busy);
        }

        let result = AssertUnwindSafe(self.process_resume(item))
            .catch_unwind()
            .await;
        self.release(&item.key).await;

        match result {
            Ok(outcome) => outcome,
            Err(panic) => Err(FlowbotError::Scheduler(format!(
                "resume panicked: {}",
                panic_message(panic)
            ))),
        }
    }

    /// Consume fired continuations until cancelled.
    pub async fn run_continuations(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<DelayedContinuation>,
        cancel: CancellationToken,
    ) {
        info!("Continuation loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    let engine = self.clone();
                    tokio::spawn(async move { engine.deliver_continuation(item).await });
                }
            }
        }
        info!("Continuation loop stopped");
    }

    /// Resume one item, re-queueing it while the conversation is busy or
    /// the store is failing.
    pub async fn deliver_continuation(&self, item: DelayedContinuation) {
        match self.resume(&item).await {
            Ok(ResumeOutcome::Resumed(report)) => {
                debug!(
                    execution_id = %report.execution_id,
                    hops = report.hops(),
                    dispatched = report.dispatched,
                    "Continuation resumed"
                );
            }
            Ok(ResumeOutcome::Busy) => self.requeue(item, "conversation busy").await,
            Ok(ResumeOutcome::Stale) => {
                debug!(execution_id = %item.execution_id, "Continuation already consumed");
            }
            Ok(ResumeOutcome::Missing) => {
                warn!(execution_id = %item.execution_id, "Continuation for unknown execution");
            }
            Err(FlowbotError::Database(e)) => {
                warn!(execution_id = %item.execution_id, error = %e, "Store error during resume");
                self.requeue(item, "store error").await;
            }
            Err(e) => {
                error!(execution_id = %item.execution_id, error = %e, "Continuation failed");
            }
        }
    }

    async fn requeue(&self, mut item: DelayedContinuation, reason: &str) {
        item.attempt += 1;
        if item.attempt >= self.config.resume_max_attempts {
            warn!(
                execution_id = %item.execution_id,
                attempts = item.attempt,
                reason,
                "Giving up on continuation"
            );
            return;
        }
        item.due_at = Utc::now() + chrono::Duration::seconds(self.config.resume_retry_secs as i64);
        debug!(execution_id = %item.execution_id, attempt = item.attempt, reason, "Continuation re-queued");
        if let Err(e) = self.delay_queue.enqueue(item).await {
            error!(error = %e, "Failed to re-queue continuation");
        }
    }

    async fn process_inbound(&self, message: &InboundMessage) -> Result<ProcessOutcome> {
        let key = &message.key;

        let Some(mut execution) = self.executions.get(key).await? else {
            let Some(graph) = self.flows.resolve(&key.device, &message.text).await? else {
                debug!(phone = %key.phone, device = %key.device, "No flow bound to device");
                return Ok(ProcessOutcome::NoFlow);
            };
            let execution = self
                .executions
                .create(key, graph.id(), &graph.start().id)
                .await?;
            info!(
                phone = %key.phone,
                device = %key.device,
                flow_id = %graph.id(),
                execution_id = %execution.execution_id,
                "Execution started"
            );
            return self
                .run_turn(&graph, execution, TurnInput::inbound(message, false))
                .await;
        };

        let graph = self.flows.get(&execution.flow_id).await?;
        if execution.waiting_for_reply {
            return self
                .run_turn(&graph, execution, TurnInput::inbound(message, true))
                .await;
        }

        let node = graph.require(&execution.current_node_id)?;
        if node.kind == NodeKind::Delay {
            if !self.delay_overdue(&graph, &execution) {
                self.skipped(key, SkipReason::DelayPending);
                return Ok(ProcessOutcome::Skipped(SkipReason::DelayPending));
            }
            let Some(target) = graph.next_target(&node.id) else {
                return self
                    .run_turn(&graph, execution, TurnInput::inbound(message, false))
                    .await;
            };
            warn!(
                execution_id = %execution.execution_id,
                node_id = %node.id,
                "Delay continuation overdue, continuing inline"
            );
            self.executions
                .upsert_advance(key, &execution.flow_id, target, false)
                .await?;
            execution.last_node_id = Some(node.id.clone());
            execution.current_node_id = target.to_string();
        }

        self.run_turn(&graph, execution, TurnInput::inbound(message, false))
            .await
    }

    async fn run_turn(
        &self,
        graph: &FlowGraph,
        execution: ExecutionState,
        input: TurnInput,
    ) -> Result<ProcessOutcome> {
        self.events.publish(FlowEvent::InboundAccepted {
            key: execution.key.clone(),
            flow_id: execution.flow_id.clone(),
            execution_id: execution.execution_id.clone(),
        });
        let report = self.interpreter.run(graph, execution, input).await?;
        Ok(ProcessOutcome::Processed(report))
    }

    async fn process_resume(&self, item: &DelayedContinuation) -> Result<ResumeOutcome> {
        let execution = match self.executions.get_by_id(&item.execution_id).await? {
            Some(execution) => Some(execution),
            None => self.executions.latest(&item.key, &item.flow_id).await?,
        };
        let Some(mut execution) = execution else {
            return Ok(ResumeOutcome::Missing);
        };

        let graph = self.flows.get(&execution.flow_id).await?;
        let parked = execution.is_active()
            && !execution.waiting_for_reply
            && graph
                .node(&execution.current_node_id)
                .is_some_and(|n| n.kind == NodeKind::Delay)
            && graph.has_edge(&execution.current_node_id, &item.target_node_id);
        if !parked {
            return Ok(ResumeOutcome::Stale);
        }

        self.executions
            .upsert_advance(&item.key, &execution.flow_id, &item.target_node_id, false)
            .await?;
        execution.last_node_id = Some(execution.current_node_id.clone());
        execution.current_node_id = item.target_node_id.clone();

        info!(
            phone = %item.key.phone,
            device = %item.key.device,
            execution_id = %execution.execution_id,
            node_id = %item.target_node_id,
            "Resuming after delay"
        );
        self.events.publish(FlowEvent::ContinuationResumed {
            key: item.key.clone(),
            target_node_id: item.target_node_id.clone(),
        });

        let report = self
            .interpreter
            .run(&graph, execution, TurnInput::resumed(&item.payload))
            .await?;
        Ok(ResumeOutcome::Resumed(report))
    }

    /// Whether a parked delay is so far past due that its continuation was
    /// most likely lost (for example across a restart).
    fn delay_overdue(&self, graph: &FlowGraph, execution: &ExecutionState) -> bool {
        let Some(node) = graph.node(&execution.current_node_id) else {
            return false;
        };
        let wait = self.interpreter.scheduler().duration_for(node)
            + self.config.lock_stale_after()
            + std::time::Duration::from_secs(
                self.config.resume_retry_secs * u64::from(self.config.resume_max_attempts),
            );
        match chrono::Duration::from_std(wait) {
            Ok(wait) => Utc::now() > execution.updated_at + wait,
            Err(_) => false,
        }
    }

    fn skipped(&self, key: &ConversationKey, reason: SkipReason) {
        self.events.publish(FlowEvent::Skipped {
            key: key.clone(),
            reason: reason.as_str().to_string(),
        });
    }

    async fn release(&self, key: &ConversationKey) {
        if let Err(e) = self.lock.release(key).await {
            error!(phone = %key.phone, device = %key.device, error = %e, "Failed to release session lock");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
