use futures::future::BoxFuture;

use flowbot_core::error::Result;
use flowbot_core::traits::MessageDispatcher;
use flowbot_core::types::MediaKind;

/// Prints outbound messages to stdout. Used by `flowbot simulate`.
#[derive(Default)]
pub struct ConsoleDispatcher;

impl ConsoleDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl MessageDispatcher for ConsoleDispatcher {
    fn name(&self) -> &str {
        "console"
    }

    fn send_text(&self, _device: &str, _recipient: &str, text: &str) -> BoxFuture<'_, Result<()>> {
        println!("bot> {}", text.replace('\n', "\n     "));
        Box::pin(async { Ok(()) })
    }

    fn send_media(
        &self,
        _device: &str,
        _recipient: &str,
        url: &str,
        kind: MediaKind,
    ) -> BoxFuture<'_, Result<()>> {
        println!("bot> [{}] {}", kind.as_str(), url);
        Box::pin(async { Ok(()) })
    }
}
