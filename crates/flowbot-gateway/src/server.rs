use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use flowbot_channels::IngressWorkerPool;
use flowbot_core::config::GatewayConfig;
use flowbot_core::traits::ExecutionStore;

use crate::routes;
use crate::state::AppState;

/// Build the gateway router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/executions/{device}/{phone}", get(routes::execution))
        .route("/webhook", post(routes::webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP webhook gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    ingress: Arc<IngressWorkerPool>,
    executions: Arc<dyn ExecutionStore>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        ingress: Arc<IngressWorkerPool>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            config,
            ingress,
            executions,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            ingress: self.ingress.clone(),
            executions: self.executions.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::future::BoxFuture;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use flowbot_channels::InboundHandler;
    use flowbot_core::config::IngressConfig;
    use flowbot_core::error::Result;
    use flowbot_core::types::InboundMessage;
    use flowbot_store::SqliteStore;
    use flowbot_test_utils::key;

    /// Never finishes, so queued messages stay queued.
    struct StuckHandler(AtomicUsize);

    impl InboundHandler for StuckHandler {
        fn handle(&self, _message: InboundMessage) -> BoxFuture<'_, Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(futures::future::pending())
        }
    }

    fn state(token: Option<&str>, queue_capacity: usize) -> (Arc<AppState>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ingress = IngressWorkerPool::start(
            Arc::new(StuckHandler(AtomicUsize::new(0))),
            &IngressConfig {
                workers: 1,
                queue_capacity,
                max_attempts: 1,
            },
            CancellationToken::new(),
        );
        let state = Arc::new(AppState {
            config: GatewayConfig {
                bind: "127.0.0.1:0".into(),
                token: token.map(String::from),
            },
            ingress: Arc::new(ingress),
            executions: store.clone(),
        });
        (state, store)
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn webhook(body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let (state, _) = state(Some("secret"), 4);
        let (status, body) = call(router(state), get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_accepts_message() {
        let (state, _) = state(None, 4);
        let payload = json!({ "phone": "555", "device": "dev-1", "message": "hi", "name": "Ana" });
        let (status, body) = call(router(state), webhook(payload, None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
    }

    #[tokio::test]
    async fn webhook_requires_token_when_configured() {
        let (state, _) = state(Some("secret"), 4);
        let payload = json!({ "phone": "555", "device": "dev-1", "message": "hi" });

        let (status, _) = call(router(state.clone()), webhook(payload.clone(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(router(state.clone()), webhook(payload.clone(), Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(router(state), webhook(payload, Some("secret"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn webhook_rejects_missing_phone() {
        let (state, _) = state(None, 4);
        let payload = json!({ "phone": " ", "device": "dev-1", "message": "hi" });
        let (status, _) = call(router(state), webhook(payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_queue_returns_429() {
        let (state, _) = state(None, 1);
        let payload = json!({ "phone": "555", "device": "dev-1", "message": "hi" });

        // Fill the worker, then the single queue slot.
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let (status, _) = call(router(state.clone()), webhook(payload.clone(), None)).await;
            statuses.push(status);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(statuses[0], StatusCode::ACCEPTED);
        assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn execution_lookup() {
        let (state, store) = state(None, 4);
        let app = router(state);

        let (status, _) = call(app.clone(), get("/api/executions/test-device/555")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        store.create(&key("555"), "welcome", "start").await.unwrap();
        let (status, body) = call(app, get("/api/executions/test-device/555")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flow_id"], "welcome");
        assert_eq!(body["current_node_id"], "start");
    }
}
