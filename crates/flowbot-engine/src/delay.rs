use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::DelayQueue;
use flowbot_core::types::{DelayedContinuation, ExecutionState, FlowNode};

/// Longest wait a `delay` node may request.
pub const MAX_DELAY: Duration = Duration::from_secs(366 * 24 * 3600);

/// Turns `delay` nodes into queued continuations.
pub struct DelayScheduler {
    queue: Arc<dyn DelayQueue>,
    default_delay: Duration,
}

impl DelayScheduler {
    pub fn new(queue: Arc<dyn DelayQueue>, default_delay: Duration) -> Self {
        Self {
            queue,
            default_delay,
        }
    }

    /// How long a `delay` node waits.
    ///
    /// Reads `delay`/`duration`/`seconds` (number or numeric string) and an
    /// optional `unit` of seconds, minutes, or hours. Waits longer than
    /// [`MAX_DELAY`] are clamped to it.
    pub fn duration_for(&self, node: &FlowNode) -> Duration {
        let Some(amount) = node.data_f64(&["delay", "duration", "seconds"]) else {
            return self.default_delay;
        };
        if !amount.is_finite() || amount < 0.0 {
            warn!(node_id = %node.id, amount, "Invalid delay, using default");
            return self.default_delay;
        }
        let unit = node
            .data_str(&["unit", "delayUnit"])
            .unwrap_or("seconds")
            .trim()
            .to_ascii_lowercase();
        let multiplier = match unit.as_str() {
            "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
            "h" | "hr" | "hour" | "hours" => 3600.0,
            _ => 1.0,
        };
        match Duration::try_from_secs_f64(amount * multiplier) {
            Ok(wait) if wait <= MAX_DELAY => wait,
            _ => {
                warn!(node_id = %node.id, amount, unit = %unit, "Delay too long, clamping");
                MAX_DELAY
            }
        }
    }

    /// Queue a continuation that resumes `execution` at `target_node_id`.
    pub async fn schedule(
        &self,
        execution: &ExecutionState,
        target_node_id: &str,
        payload: &str,
        after: Duration,
    ) -> Result<DelayedContinuation> {
        let wait = chrono::Duration::from_std(after)
            .map_err(|e| FlowbotError::Scheduler(format!("delay out of range: {}", e)))?;
        let due_at = Utc::now()
            .checked_add_signed(wait)
            .ok_or_else(|| FlowbotError::Scheduler("delay out of range".to_string()))?;
        let item = DelayedContinuation {
            execution_id: execution.execution_id.clone(),
            flow_id: execution.flow_id.clone(),
            target_node_id: target_node_id.to_string(),
            key: execution.key.clone(),
            payload: payload.to_string(),
            due_at,
            attempt: 0,
        };
        self.queue.enqueue(item.clone()).await?;
        debug!(
            execution_id = %item.execution_id,
            target = %item.target_node_id,
            delay_ms = after.as_millis() as u64,
            "Continuation scheduled"
        );
        Ok(item)
    }
}

/// In-process delay queue: each item sleeps on a tokio timer, then is
/// forwarded to the receiver returned by [`TokioDelayQueue::new`].
///
/// Pending items are lost on shutdown or restart.
pub struct TokioDelayQueue {
    tx: mpsc::UnboundedSender<DelayedContinuation>,
    cancel: CancellationToken,
}

impl TokioDelayQueue {
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<DelayedContinuation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, cancel }, rx)
    }
}

impl DelayQueue for TokioDelayQueue {
    fn enqueue(&self, item: DelayedContinuation) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.tx.is_closed() || self.cancel.is_cancelled() {
                return Err(FlowbotError::Scheduler("delay queue is closed".to_string()));
            }
            let tx = self.tx.clone();
            let cancel = self.cancel.clone();
            let wait = (item.due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(
                            execution_id = %item.execution_id,
                            target = %item.target_node_id,
                            "Dropping pending continuation at shutdown"
                        );
                    }
                    _ = tokio::time::sleep(wait) => {
                        if tx.send(item).is_err() {
                            warn!("Continuation receiver dropped");
                        }
                    }
                }
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use flowbot_core::types::{ConversationKey, NodeKind};

    fn scheduler(queue: Arc<dyn DelayQueue>) -> DelayScheduler {
        DelayScheduler::new(queue, Duration::from_secs(5))
    }

    #[test]
    fn test_duration_from_node_data() {
        let (queue, _rx) = TokioDelayQueue::new(CancellationToken::new());
        let s = scheduler(Arc::new(queue));

        let plain = FlowNode::new("d", NodeKind::Delay);
        assert_eq!(s.duration_for(&plain), Duration::from_secs(5));

        let secs = FlowNode::new("d", NodeKind::Delay).with("delay", json!("12"));
        assert_eq!(s.duration_for(&secs), Duration::from_secs(12));

        let mins = FlowNode::new("d", NodeKind::Delay)
            .with("duration", json!(2))
            .with("unit", json!("Minutes"));
        assert_eq!(s.duration_for(&mins), Duration::from_secs(120));

        let bad = FlowNode::new("d", NodeKind::Delay).with("seconds", json!(-3));
        assert_eq!(s.duration_for(&bad), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let (queue, _rx) = TokioDelayQueue::new(CancellationToken::new());
        let s = scheduler(Arc::new(queue));

        let hours = FlowNode::new("d", NodeKind::Delay)
            .with("delay", json!(1e16))
            .with("unit", json!("hours"));
        assert_eq!(s.duration_for(&hours), MAX_DELAY);

        let secs = FlowNode::new("d", NodeKind::Delay).with("delay", json!(1e20));
        assert_eq!(s.duration_for(&secs), MAX_DELAY);

        let half_hour = FlowNode::new("d", NodeKind::Delay)
            .with("delay", json!(30))
            .with("unit", json!("minutes"));
        assert_eq!(s.duration_for(&half_hour), Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_schedule_max_delay() {
        let (queue, _rx) = TokioDelayQueue::new(CancellationToken::new());
        let s = scheduler(Arc::new(queue));
        let execution = ExecutionState::new("f1", ConversationKey::new("628111", "dev-1"), "d");

        let item = s.schedule(&execution, "next", "", MAX_DELAY).await.unwrap();
        assert!(item.due_at > Utc::now() + chrono::Duration::days(365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_fires_not_before_due() {
        let (queue, mut rx) = TokioDelayQueue::new(CancellationToken::new());
        let s = scheduler(Arc::new(queue));
        let execution = ExecutionState::new("f1", ConversationKey::new("628111", "dev-1"), "d");

        let start = tokio::time::Instant::now();
        let item = s
            .schedule(&execution, "next", "hello", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(item.target_node_id, "next");
        assert_eq!(item.payload, "hello");

        let fired = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(fired.execution_id, execution.execution_id);
    }

    #[tokio::test]
    async fn test_enqueue_after_cancel_fails() {
        let cancel = CancellationToken::new();
        let (queue, _rx) = TokioDelayQueue::new(cancel.clone());
        cancel.cancel();
        let s = scheduler(Arc::new(queue));
        let execution = ExecutionState::new("f1", ConversationKey::new("628111", "dev-1"), "d");
        let err = s
            .schedule(&execution, "next", "", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowbotError::Scheduler(_)));
    }
}
