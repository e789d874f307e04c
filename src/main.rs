use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowbot_channels::{ConsoleDispatcher, HttpDispatcher, HttpMediaValidator, IngressWorkerPool};
use flowbot_core::config::{AppConfig, FlowBinding};
use flowbot_core::event::EventBus;
use flowbot_core::traits::{AiGenerator, MediaValidator, MessageDispatcher};
use flowbot_core::types::{ConversationKey, InboundMessage};
use flowbot_engine::{
    Collaborators, FileFlowSource, FlowEngine, FlowGraph, ProcessOutcome, TokioDelayQueue,
};
use flowbot_gateway::GatewayServer;
use flowbot_store::SqliteStore;

#[derive(Parser)]
#[command(name = "flowbot", version, about = "Scripted conversation engine for chat devices")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingress workers, delay loop and webhook gateway
    Serve {
        /// Process continuations only, without the HTTP gateway
        #[arg(long)]
        no_gateway: bool,
    },
    /// Chat with a flow on the terminal (in-memory state)
    Simulate {
        /// Device the conversation is addressed to
        #[arg(long)]
        device: String,
        /// Phone number to pose as
        #[arg(long, default_value = "simulator")]
        phone: String,
        /// Run this flow regardless of configured bindings
        #[arg(long)]
        flow: Option<String>,
    },
    /// Validate a flow definition file
    Check {
        file: PathBuf,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowbot=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Checking a flow file needs no config
    if let Commands::Check { file } = &cli.command {
        return check_flow(file);
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults. See flowbot.toml.example for reference.",
            cli.config.display()
        );
        AppConfig::default()
    };

    match cli.command {
        Commands::Check { .. } => Ok(()),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve { no_gateway } => serve(config, no_gateway).await,
        Commands::Simulate {
            device,
            phone,
            flow,
        } => simulate(config, device, phone, flow).await,
    }
}

fn check_flow(path: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let graph = FlowGraph::from_json(&json)?;

    println!(
        "{}: flow '{}' ({}) ok, {} nodes",
        path.display(),
        graph.id(),
        graph.name(),
        graph.len()
    );
    for kind in graph.unknown_kinds() {
        println!("  warning: unknown node type '{kind}' will pass through like `manual`");
    }
    Ok(())
}

fn build_ai(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn AiGenerator>>> {
    match &config.ai {
        Some(ai) => {
            info!(provider = %ai.provider, model = %ai.model_id, "AI generation enabled");
            Ok(Some(flowbot_llm::create_generator(ai)?))
        }
        None => Ok(None),
    }
}

async fn serve(config: AppConfig, no_gateway: bool) -> anyhow::Result<()> {
    let db_path = config.storage_path();
    let store = Arc::new(SqliteStore::open(&db_path)?.with_lock_settings(&config.engine)?);
    let flows = Arc::new(FileFlowSource::load(&config.flows_dir(), &config.flows.bindings)?);
    info!(flows = flows.flow_ids().len(), dir = %flows.dir().display(), "Flows loaded");

    let (dispatcher, media): (Arc<dyn MessageDispatcher>, Option<Arc<dyn MediaValidator>>) =
        match &config.provider {
            Some(provider) => {
                let media: Option<Arc<dyn MediaValidator>> = if provider.validate_media {
                    Some(Arc::new(HttpMediaValidator::new(Duration::from_secs(
                        provider.timeout_secs,
                    ))?))
                } else {
                    None
                };
                (Arc::new(HttpDispatcher::new(provider.clone())?), media)
            }
            None => {
                warn!("No [provider] configured, printing outbound messages to stdout");
                (Arc::new(ConsoleDispatcher::new()), None)
            }
        };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    let (delay_queue, continuations) = TokioDelayQueue::new(cancel.clone());
    let engine = Arc::new(FlowEngine::new(
        config.engine.clone(),
        Collaborators {
            flows,
            lock: store.clone(),
            executions: store.clone(),
            history: store.clone(),
            dispatcher,
            delay_queue: Arc::new(delay_queue),
            ai: build_ai(&config)?,
            media,
            captures: Some(store.clone()),
        },
        Arc::new(EventBus::default()),
    ));

    tokio::spawn(engine.clone().run_continuations(continuations, cancel.clone()));
    let ingress = Arc::new(IngressWorkerPool::start(engine, &config.ingress, cancel.clone()));

    if no_gateway {
        info!("Gateway disabled, waiting for shutdown");
        cancel.cancelled().await;
    } else {
        let server = GatewayServer::new(
            config.gateway.clone().unwrap_or_default(),
            ingress.clone(),
            store.clone(),
        );
        server.run(cancel.clone()).await?;
        cancel.cancel();
    }

    ingress.shutdown().await;
    Ok(())
}

async fn simulate(
    config: AppConfig,
    device: String,
    phone: String,
    flow: Option<String>,
) -> anyhow::Result<()> {
    let bindings = match flow {
        Some(flow_id) => vec![FlowBinding {
            device: device.clone(),
            flow_id,
            trigger: None,
        }],
        None => config.flows.bindings.clone(),
    };
    let flows = Arc::new(FileFlowSource::load(&config.flows_dir(), &bindings)?);
    let store = Arc::new(SqliteStore::in_memory()?.with_lock_settings(&config.engine)?);

    let cancel = CancellationToken::new();
    let (delay_queue, continuations) = TokioDelayQueue::new(cancel.clone());
    let engine = Arc::new(FlowEngine::new(
        config.engine.clone(),
        Collaborators {
            flows,
            lock: store.clone(),
            executions: store.clone(),
            history: store.clone(),
            dispatcher: Arc::new(ConsoleDispatcher::new()),
            delay_queue: Arc::new(delay_queue),
            ai: build_ai(&config)?,
            media: None,
            captures: Some(store.clone()),
        },
        Arc::new(EventBus::default()),
    ));
    tokio::spawn(engine.clone().run_continuations(continuations, cancel.clone()));

    let key = ConversationKey::new(phone, device);
    println!(
        "Simulating {} on device {}. Type /quit to exit.",
        key.phone, key.device
    );

    let stdin = io::stdin();
    loop {
        print!("you> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim_end_matches(['\r', '\n']);
        if text == "/quit" || text == "/exit" {
            break;
        }

        let message = InboundMessage::new(key.clone(), text);
        match engine.handle_inbound(&message).await? {
            ProcessOutcome::Processed(report) => {
                if report.completed {
                    println!("  (flow completed)");
                } else if let Some(item) = &report.scheduled {
                    println!("  (continues at {})", item.due_at.format("%H:%M:%S"));
                } else if report.hop_limit_exceeded {
                    println!("  (aborted: hop limit reached)");
                }
            }
            ProcessOutcome::Skipped(reason) => println!("  (skipped: {})", reason.as_str()),
            ProcessOutcome::NoFlow => println!("  (no flow bound to device {})", key.device),
            ProcessOutcome::Failed(e) => println!("  (failed: {e})"),
        }
    }

    cancel.cancel();
    Ok(())
}
