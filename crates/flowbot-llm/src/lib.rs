pub mod openai;
pub mod retry;

use std::sync::Arc;

use flowbot_core::config::AiConfig;
use flowbot_core::error::Result;
use flowbot_core::traits::AiGenerator;

pub use openai::OpenAiGenerator;
pub use retry::RetryingGenerator;

/// Build the configured generator, wrapped in retry.
///
/// Every provider speaks the OpenAI chat-completions dialect; `provider`
/// only selects the default base URL.
pub fn create_generator(config: &AiConfig) -> Result<Arc<dyn AiGenerator>> {
    let inner: Arc<dyn AiGenerator> = Arc::new(OpenAiGenerator::new(config.clone())?);
    Ok(Arc::new(RetryingGenerator::new(inner, config.retry.clone())))
}
