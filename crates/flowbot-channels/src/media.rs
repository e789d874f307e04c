use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::{Response, StatusCode};
use tracing::debug;

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::MediaValidator;
use flowbot_core::types::MediaKind;

/// Map a `Content-Type` header value to a media kind.
pub fn classify_content_type(content_type: &str) -> Option<MediaKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let (top, _) = mime.split_once('/')?;
    MediaKind::parse(top)
}

/// Probes media URLs with `HEAD`, falling back to a one-byte ranged `GET`
/// for servers that refuse `HEAD` or omit the content type.
pub struct HttpMediaValidator {
    http: reqwest::Client,
}

impl HttpMediaValidator {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowbotError::MediaValidation {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    async fn fetch_kind(&self, url: &str) -> Result<MediaKind> {
        let invalid = |message: String| FlowbotError::MediaValidation {
            url: url.to_string(),
            message,
        };

        if let Ok(resp) = self.http.head(url).send().await {
            if resp.status().is_success() {
                if let Some(kind) = kind_of(&resp) {
                    return Ok(kind);
                }
            } else if resp.status() != StatusCode::METHOD_NOT_ALLOWED {
                return Err(invalid(format!("HEAD returned {}", resp.status())));
            }
        }

        debug!(%url, "HEAD inconclusive, trying ranged GET");
        let resp = self
            .http
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| invalid(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(invalid(format!("GET returned {}", resp.status())));
        }
        kind_of(&resp).ok_or_else(|| invalid("unsupported content type".into()))
    }
}

fn kind_of(resp: &Response) -> Option<MediaKind> {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(classify_content_type)
}

impl MediaValidator for HttpMediaValidator {
    fn classify(&self, url: &str) -> BoxFuture<'_, Result<MediaKind>> {
        let url = url.to_string();
        Box::pin(async move { self.fetch_kind(&url).await })
    }
}
