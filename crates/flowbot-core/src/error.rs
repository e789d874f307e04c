use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowbotError {
    // Flow definition errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Invalid flow {flow_id}: {message}")]
    InvalidFlow { flow_id: String, message: String },

    #[error("Node '{node_id}' not found in flow {flow_id}")]
    NodeNotFound { flow_id: String, node_id: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Outbound delivery errors
    #[error("Dispatch failed: {channel}: {message}")]
    Dispatch { channel: String, message: String },

    #[error("Media validation failed for {url}: {message}")]
    MediaValidation { url: String, message: String },

    // AI collaborator errors
    #[error("AI request failed: {0}")]
    AiRequest(String),

    #[error("AI response parse error: {0}")]
    AiParse(String),

    // Scheduling / ingress errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Ingress queue is full")]
    QueueFull,

    #[error("Ingress pool is shut down")]
    PoolClosed,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowbotError {
    pub fn invalid_flow(flow_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFlow {
            flow_id: flow_id.into(),
            message: message.into(),
        }
    }

    pub fn dispatch(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowbotError>;
