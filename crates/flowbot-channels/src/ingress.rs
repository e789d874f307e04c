use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowbot_core::config::IngressConfig;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::types::InboundMessage;
use flowbot_engine::{FlowEngine, ProcessOutcome};

/// Consumer of inbound messages pulled off the ingress queue.
pub trait InboundHandler: Send + Sync + 'static {
    /// An `Err` asks the pool to retry the message.
    fn handle(&self, message: InboundMessage) -> BoxFuture<'_, Result<()>>;
}

impl InboundHandler for FlowEngine {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.handle_inbound(&message).await? {
                ProcessOutcome::Processed(report) => {
                    debug!(
                        phone = %message.key.phone,
                        flow = %report.flow_id,
                        hops = report.hops(),
                        "Inbound processed"
                    );
                }
                ProcessOutcome::Skipped(reason) => {
                    debug!(phone = %message.key.phone, reason = reason.as_str(), "Inbound skipped");
                }
                ProcessOutcome::NoFlow => {
                    debug!(device = %message.key.device, "No flow bound to device");
                }
                ProcessOutcome::Failed(msg) => {
                    warn!(phone = %message.key.phone, error = %msg, "Inbound processing failed");
                }
            }
            Ok(())
        })
    }
}

struct Job {
    message: InboundMessage,
    attempt: u32,
}

/// Bounded queue in front of a fixed set of workers.
pub struct IngressWorkerPool {
    tx: mpsc::Sender<Job>,
    handler: Arc<dyn InboundHandler>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl IngressWorkerPool {
    pub fn start(
        handler: Arc<dyn InboundHandler>,
        config: &IngressConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let max_attempts = config.max_attempts.max(1);
        let count = config.workers.max(1);

        let workers: Vec<_> = (0..count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    handler.clone(),
                    rx.clone(),
                    tx.clone(),
                    max_attempts,
                    cancel.clone(),
                ))
            })
            .collect();

        info!(workers = count, capacity = config.queue_capacity, "Ingress pool started");

        Self {
            tx,
            handler,
            workers: std::sync::Mutex::new(workers),
            cancel,
        }
    }

    /// Enqueue without waiting. Fails fast when the queue is full.
    pub fn submit(&self, message: InboundMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FlowbotError::PoolClosed);
        }
        self.tx
            .try_send(Job {
                message,
                attempt: 1,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => FlowbotError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => FlowbotError::PoolClosed,
            })
    }

    /// Run the handler on the caller's task, bypassing the queue.
    pub async fn dispatch_now(&self, message: InboundMessage) -> Result<()> {
        self.handler.handle(message).await
    }

    /// Free slots left in the queue.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    /// Stop the workers and wait for in-flight messages to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Ingress worker panicked");
            }
        }
        info!("Ingress pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    handler: Arc<dyn InboundHandler>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    tx: mpsc::Sender<Job>,
    max_attempts: u32,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!(worker = id, "Ingress worker exiting");
            break;
        };

        let phone = job.message.key.phone.clone();
        if let Err(e) = handler.handle(job.message.clone()).await {
            if job.attempt < max_attempts {
                warn!(worker = id, %phone, attempt = job.attempt, error = %e, "Handler failed, retrying");
                let retry = Job {
                    message: job.message,
                    attempt: job.attempt + 1,
                };
                if tx.try_send(retry).is_err() {
                    error!(worker = id, %phone, "Ingress queue full, dropping retry");
                }
            } else {
                error!(worker = id, %phone, attempts = job.attempt, error = %e, "Handler failed, giving up");
            }
        }
    }
}
