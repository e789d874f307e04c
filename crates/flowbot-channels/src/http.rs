use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowbot_core::config::ProviderConfig;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::MessageDispatcher;
use flowbot_core::types::MediaKind;

use crate::util::split_message;

const CHANNEL: &str = "http";

/// Delivers messages through a chat provider's HTTP API.
///
/// Text goes to `POST {base_url}/send-message` as `{device, phone, message}`,
/// media to `POST {base_url}/send-media` as `{device, phone, url, type}`.
pub struct HttpDispatcher {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowbotError::dispatch(CHANNEL, e.to_string()))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<()> {
        let mut request = self.http.post(self.endpoint(path)).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| FlowbotError::dispatch(CHANNEL, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(FlowbotError::dispatch(
                CHANNEL,
                format!("{path} returned {status}: {snippet}"),
            ));
        }
        Ok(())
    }
}

impl MessageDispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        CHANNEL
    }

    fn send_text(&self, device: &str, recipient: &str, text: &str) -> BoxFuture<'_, Result<()>> {
        let device = device.to_string();
        let recipient = recipient.to_string();
        let chunks = split_message(text, self.config.max_message_len);
        Box::pin(async move {
            for chunk in chunks {
                self.post(
                    "send-message",
                    json!({ "device": device, "phone": recipient, "message": chunk }),
                )
                .await?;
            }
            debug!(%device, %recipient, "Text delivered");
            Ok(())
        })
    }

    fn send_media(
        &self,
        device: &str,
        recipient: &str,
        url: &str,
        kind: MediaKind,
    ) -> BoxFuture<'_, Result<()>> {
        let body = json!({
            "device": device,
            "phone": recipient,
            "url": url,
            "type": kind.as_str(),
        });
        Box::pin(async move { self.post("send-media", body).await })
    }
}
