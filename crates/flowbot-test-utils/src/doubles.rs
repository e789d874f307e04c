use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::{
    AiGenerator, ConversationHistory, DelayQueue, MediaValidator, MessageDispatcher,
};
use flowbot_core::types::{AiRequest, ConversationKey, DelayedContinuation, HistoryEntry, MediaKind};

/// One message handed to a [`RecordingDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        device: String,
        recipient: String,
        text: String,
    },
    Media {
        device: String,
        recipient: String,
        url: String,
        kind: MediaKind,
    },
}

impl Sent {
    /// The text, or the URL for media.
    pub fn body(&self) -> &str {
        match self {
            Self::Text { text, .. } => text,
            Self::Media { url, .. } => url,
        }
    }
}

/// Records every outbound message. Can be told to fail texts containing a
/// marker, and to sleep before each send to widen race windows.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<Sent>>,
    fail_marker: Option<String>,
    latency: Option<Duration>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent().iter().map(|s| s.body().to_string()).collect()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MessageDispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    fn send_text(&self, device: &str, recipient: &str, text: &str) -> BoxFuture<'_, Result<()>> {
        let sent = Sent::Text {
            device: device.to_string(),
            recipient: recipient.to_string(),
            text: text.to_string(),
        };
        let fail = self
            .fail_marker
            .as_deref()
            .is_some_and(|marker| text.contains(marker));
        Box::pin(async move {
            self.pause().await;
            if fail {
                return Err(FlowbotError::dispatch("recording", "scripted failure"));
            }
            self.sent.lock().unwrap().push(sent);
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
        let sent = Sent::Media {
            device: device.to_string(),
            recipient: recipient.to_string(),
            url: url.to_string(),
            kind,
        };
        Box::pin(async move {
            self.pause().await;
            self.sent.lock().unwrap().push(sent);
            Ok(())
        })
    }
}

/// Returns queued replies in order and records each request.
#[derive(Default)]
pub struct ScriptedAi {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<AiRequest>>,
}

impl ScriptedAi {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(Ok(reply.to_string()));
    }

    pub fn push_error(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(FlowbotError::AiRequest(message.to_string())));
    }

    pub fn requests(&self) -> Vec<AiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AiGenerator for ScriptedAi {
    fn generate(&self, request: AiRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FlowbotError::AiRequest("no scripted reply left".into())))
        })
    }
}

/// In-memory conversation history.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<HashMap<ConversationKey, Vec<HistoryEntry>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self, key: &ConversationKey) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

impl ConversationHistory for MemoryHistory {
    fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        Box::pin(async move {
            self.entries.lock().unwrap().entry(key).or_default().push(entry);
            Ok(())
        })
    }

    fn read(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<HistoryEntry>>> {
        let all = self.all(key);
        Box::pin(async move {
            let skip = all.len().saturating_sub(limit);
            Ok(all.into_iter().skip(skip).collect())
        })
    }
}

/// Keeps enqueued continuations for the test to deliver by hand.
#[derive(Default)]
pub struct RecordingDelayQueue {
    items: Mutex<Vec<DelayedContinuation>>,
}

impl RecordingDelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<DelayedContinuation> {
        self.items.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<DelayedContinuation> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }
}

impl DelayQueue for RecordingDelayQueue {
    fn enqueue(&self, item: DelayedContinuation) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.items.lock().unwrap().push(item);
            Ok(())
        })
    }
}

/// Media validator answering from a fixed table; unknown URLs fail.
#[derive(Default)]
pub struct StaticMediaValidator {
    known: HashMap<String, MediaKind>,
}

impl StaticMediaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, kind: MediaKind) -> Self {
        self.known.insert(url.to_string(), kind);
        self
    }
}

impl MediaValidator for StaticMediaValidator {
    fn classify(&self, url: &str) -> BoxFuture<'_, Result<MediaKind>> {
        let result = self.known.get(url).copied().ok_or_else(|| FlowbotError::MediaValidation {
            url: url.to_string(),
            message: "not reachable".to_string(),
        });
        Box::pin(async move { result })
    }
}
