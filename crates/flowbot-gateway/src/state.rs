use std::sync::Arc;

use flowbot_channels::IngressWorkerPool;
use flowbot_core::config::GatewayConfig;
use flowbot_core::traits::ExecutionStore;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub ingress: Arc<IngressWorkerPool>,
    pub executions: Arc<dyn ExecutionStore>,
}
