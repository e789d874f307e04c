use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use flowbot_core::config::RetryConfig;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::AiGenerator;
use flowbot_core::types::AiRequest;

/// A generator that retries transient failures with exponential backoff.
pub struct RetryingGenerator {
    inner: Arc<dyn AiGenerator>,
    retry_config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn AiGenerator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &FlowbotError) -> bool {
    match e {
        FlowbotError::AiRequest(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("504")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl AiGenerator for RetryingGenerator {
    fn generate(&self, request: AiRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.generate(request.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying AI request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
