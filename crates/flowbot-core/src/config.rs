use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowbotError, Result};

/// Top-level Flowbot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
    #[serde(default)]
    pub ai: Option<AiConfig>,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

/// Interpreter, lock, and delay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node transitions per invocation before aborting.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// A session lock older than this may be taken over.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    /// How long lock acquisition waits on a busy database before giving up.
    #[serde(default = "default_lock_busy_timeout_ms")]
    pub lock_busy_timeout_ms: u64,
    #[serde(default = "default_delay_secs")]
    pub default_delay_secs: u64,
    /// Pause between consecutive AI response items.
    #[serde(default = "default_ai_item_delay_ms")]
    pub ai_item_delay_ms: u64,
    /// History entries included in AI prompts.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Back-off before retrying a continuation whose conversation was busy.
    #[serde(default = "default_resume_retry_secs")]
    pub resume_retry_secs: u64,
    #[serde(default = "default_resume_max_attempts")]
    pub resume_max_attempts: u32,
    /// Sent instead of a media link that failed validation.
    #[serde(default = "default_media_fallback_text")]
    pub media_fallback_text: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            lock_stale_secs: default_lock_stale_secs(),
            lock_busy_timeout_ms: default_lock_busy_timeout_ms(),
            default_delay_secs: default_delay_secs(),
            ai_item_delay_ms: default_ai_item_delay_ms(),
            history_limit: default_history_limit(),
            resume_retry_secs: default_resume_retry_secs(),
            resume_max_attempts: default_resume_max_attempts(),
            media_fallback_text: default_media_fallback_text(),
        }
    }
}

impl EngineConfig {
    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn lock_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_busy_timeout_ms)
    }

    pub fn ai_item_delay(&self) -> Duration {
        Duration::from_millis(self.ai_item_delay_ms)
    }
}

fn default_max_hops() -> usize { 50 }
fn default_lock_stale_secs() -> u64 { 30 }
fn default_lock_busy_timeout_ms() -> u64 { 500 }
fn default_delay_secs() -> u64 { 5 }
fn default_ai_item_delay_ms() -> u64 { 1000 }
fn default_history_limit() -> usize { 20 }
fn default_resume_retry_secs() -> u64 { 2 }
fn default_resume_max_attempts() -> u32 { 5 }
fn default_media_fallback_text() -> String {
    "Sorry, this media is not available right now.".to_string()
}

/// Inbound worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Total attempts for an event whose handler returned an error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_workers() -> usize { 8 }
fn default_queue_capacity() -> usize { 1024 }
fn default_max_attempts() -> u32 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String { "~/.flowbot/flowbot.db".to_string() }

/// Where flows come from and which device runs which flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowsConfig {
    #[serde(default = "default_flows_dir")]
    pub dir: String,
    #[serde(default)]
    pub bindings: Vec<FlowBinding>,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            dir: default_flows_dir(),
            bindings: Vec::new(),
        }
    }
}

fn default_flows_dir() -> String { "flows".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBinding {
    pub device: String,
    pub flow_id: String,
    /// Only start this flow when the first message equals the trigger (case-insensitive).
    #[serde(default)]
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_ai_temperature")]
    pub temperature: f32,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_ai_provider() -> String { "openai".to_string() }
fn default_ai_max_tokens() -> u32 { 1024 }
fn default_ai_temperature() -> f32 { 0.3 }
fn default_ai_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 15000 }

/// Outbound message provider (the HTTP API behind the chat devices).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_validate_media")]
    pub validate_media: bool,
}

fn default_provider_timeout_secs() -> u64 { 30 }
fn default_max_message_len() -> usize { 4096 }
fn default_validate_media() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on the webhook (None = open).
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowbotError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| FlowbotError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    pub fn flows_dir(&self) -> PathBuf {
        expand_home(&self.flows.dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
