use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flowbot_channels::{InboundHandler, IngressWorkerPool};
use flowbot_core::config::{EngineConfig, FlowBinding, IngressConfig};
use flowbot_core::event::EventBus;
use flowbot_core::traits::{ConversationHistory, ExecutionStore};
use flowbot_core::types::{ConversationKey, ExecutionStatus, FlowEvent, InboundMessage};
use flowbot_engine::{
    Collaborators, FileFlowSource, FlowEngine, FlowGraph, ProcessOutcome, TokioDelayQueue,
};
use flowbot_store::SqliteStore;
use flowbot_test_utils::RecordingDispatcher;

const DEVICE: &str = "shop-01";

fn flows_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("flows")
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        ai_item_delay_ms: 0,
        ..EngineConfig::default()
    }
}

struct App {
    engine: Arc<FlowEngine>,
    store: Arc<SqliteStore>,
    dispatcher: Arc<RecordingDispatcher>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

fn app(db: &Path) -> App {
    let config = engine_config();
    let bindings = vec![FlowBinding {
        device: DEVICE.into(),
        flow_id: "welcome".into(),
        trigger: None,
    }];
    let flows = Arc::new(FileFlowSource::load(&flows_dir(), &bindings).expect("load flows"));
    let store = Arc::new(
        SqliteStore::open(db)
            .and_then(|s| s.with_lock_settings(&config))
            .expect("open store"),
    );
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let events = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();
    let (delay_queue, continuations) = TokioDelayQueue::new(cancel.clone());

    let engine = Arc::new(FlowEngine::new(
        config,
        Collaborators {
            flows,
            lock: store.clone(),
            executions: store.clone(),
            history: store.clone(),
            dispatcher: dispatcher.clone(),
            delay_queue: Arc::new(delay_queue),
            ai: None,
            media: None,
            captures: Some(store.clone()),
        },
        events.clone(),
    ));
    tokio::spawn(engine.clone().run_continuations(continuations, cancel.clone()));

    App {
        engine,
        store,
        dispatcher,
        events,
        cancel,
    }
}

fn customer() -> ConversationKey {
    ConversationKey::new("628123", DEVICE)
}

fn inbound(text: &str) -> InboundMessage {
    let mut msg = InboundMessage::new(customer(), text);
    msg.display_name = Some("Ana".into());
    msg
}

async fn processed(app: &App, text: &str) -> flowbot_engine::TurnReport {
    match app.engine.handle_inbound(&inbound(text)).await.unwrap() {
        ProcessOutcome::Processed(report) => report,
        other => panic!("expected Processed, got {other:?}"),
    }
}

#[test]
fn shipped_flow_is_valid() {
    let json = std::fs::read_to_string(flows_dir().join("welcome.json")).unwrap();
    let graph = FlowGraph::from_json(&json).unwrap();
    assert_eq!(graph.id(), "welcome");
    assert_eq!(graph.start().id, "start");
    assert!(graph.unknown_kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn welcome_flow_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir.path().join("flowbot.db"));
    let mut events = app.events.subscribe();

    // First contact: greeting, stage, menu, then park on the reply node.
    let report = processed(&app, "hello").await;
    assert!(report.waiting_for_reply);
    assert_eq!(report.final_node_id, "wait");
    assert_eq!(
        app.dispatcher.bodies(),
        vec![
            "Hi Ana! Welcome to the shop.",
            "Reply 1 for prices or 2 for opening hours.",
        ]
    );
    let execution = app.store.get(&customer()).await.unwrap().unwrap();
    assert_eq!(execution.stage.as_deref(), Some("new-lead"));

    // Reply routes through the condition and parks on the delay.
    let report = processed(&app, " Hours ").await;
    assert_eq!(report.final_node_id, "pause");
    assert!(report.scheduled.is_some());
    assert_eq!(
        app.dispatcher.bodies().last().map(String::as_str),
        Some("We are open 9-17, Monday to Saturday.")
    );

    // Messages while the delay is pending are not processed.
    let outcome = app.engine.handle_inbound(&inbound("hello?")).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Skipped(_)));

    // The continuation fires and finishes the flow.
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(FlowEvent::ExecutionCompleted { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("flow did not complete");

    assert_eq!(
        app.dispatcher.bodies().last().map(String::as_str),
        Some("Anything else? Just say hi.")
    );
    assert!(app.store.get(&customer()).await.unwrap().is_none());
    let last = app
        .store
        .latest(&customer(), "welcome")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.status, ExecutionStatus::Completed);
    assert_eq!(last.current_node_id, "end");

    let history = app.store.read(&customer(), 20).await.unwrap();
    assert_eq!(history[0].user_text, "hello");
    assert_eq!(history[0].display_name.as_deref(), Some("Ana"));
    assert!(history.iter().any(|h| h.user_text == " Hours "));

    app.cancel.cancel();
}

#[tokio::test]
async fn unmatched_reply_takes_default_branch() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir.path().join("flowbot.db"));

    processed(&app, "hi").await;
    let report = processed(&app, "what?").await;
    assert!(report.completed);
    assert_eq!(
        app.dispatcher.bodies().last().map(String::as_str),
        Some("Sorry, I did not get that. A human will follow up.")
    );
    app.cancel.cancel();
}

#[tokio::test]
async fn waiting_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("flowbot.db");

    {
        let first = app(&db);
        processed(&first, "hi").await;
        first.cancel.cancel();
    }

    let second = app(&db);
    let report = processed(&second, "1").await;
    assert_eq!(second.dispatcher.bodies(), vec!["Shoes start at $40."]);
    assert_eq!(report.final_node_id, "pause");
    second.cancel.cancel();
}

#[tokio::test]
async fn ingress_pool_feeds_engine() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir.path().join("flowbot.db"));
    let cancel = CancellationToken::new();
    let handler: Arc<dyn InboundHandler> = app.engine.clone();
    let pool = IngressWorkerPool::start(
        handler,
        &IngressConfig {
            workers: 2,
            queue_capacity: 16,
            max_attempts: 2,
        },
        cancel.clone(),
    );

    pool.submit(inbound("hi")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.dispatcher.bodies().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool did not process the message");

    let execution = app.store.get(&customer()).await.unwrap().unwrap();
    assert!(execution.waiting_for_reply);

    pool.shutdown().await;
    app.cancel.cancel();
}
