//! The minder server binary: loads settings, wires every component in
//! dependency order, starts channels and the webhook ingress, and shuts
//! down gracefully on SIGINT/SIGTERM (channels first, then workers, then
//! background sweepers).
//!
//! Exit codes: 0 normal, 1 configuration error, 2 unrecoverable startup
//! failure.

mod commands;
mod webhook;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use minder_agent::memory::StorageMemory;
use minder_agent::ports::UnconfiguredLlm;
use minder_agent::skills::SkillRegistry;
use minder_agent::{CoordinatorHandle, Pipeline, TurnCoordinator, TurnDeps};
use minder_channels::{AdmissionService, Channel, ChannelManager, InboundHandler};
use minder_core::{SettingsStore, SystemClock};
use minder_mcp::{McpPool, PoolConfig};
use minder_sessions::SessionStore;
use minder_storage::{FsStorage, Storage};
use minder_telegram::TelegramChannel;
use minder_usage::UsageTracker;

#[derive(Debug, Parser)]
#[command(name = "minder", about = "Multi-channel AI assistant server")]
struct Args {
    /// Path to minder.toml (defaults to ~/.minder/minder.toml).
    #[arg(long)]
    config: Option<String>,

    /// Log filter, e.g. "minder=debug" (overrides RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "minder=info,tower_http=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(2);
        }
    };
    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    // Missing or malformed configuration is fatal: exit 1.
    let settings = match SettingsStore::open(args.config.as_deref()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };
    let snapshot = settings.snapshot();

    // Storage must be reachable at startup: exit 2 otherwise.
    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(snapshot.storage.path.clone()));
    if let Err(e) = storage.put_text(".startup-probe", "ok").await {
        error!(error = %e, path = %snapshot.storage.path, "storage unreachable");
        return ExitCode::from(2);
    }
    let _ = storage.delete(".startup-probe").await;

    let clock = Arc::new(SystemClock);

    // Leaves first, dependents after.
    let sessions = Arc::new(SessionStore::new(storage.clone(), clock.clone()));
    let usage = Arc::new(UsageTracker::new(
        storage.clone(),
        clock.clone(),
        snapshot.usage.dir.clone(),
        snapshot.usage.retention_days,
        snapshot.usage.enabled,
    ));
    usage.load().await;

    let mcp = Arc::new(McpPool::new(PoolConfig {
        enabled: snapshot.mcp.enabled,
        startup_timeout: Duration::from_secs(snapshot.mcp.startup_timeout_secs),
        idle_timeout: Duration::from_secs(snapshot.mcp.idle_timeout_secs),
        request_timeout: Duration::from_secs(snapshot.mcp.request_timeout_secs),
    }));

    let skills = Arc::new(SkillRegistry::new(storage.clone(), snapshot.skills.dir.clone()));
    skills.load().await;

    let memory = Arc::new(StorageMemory::new(storage.clone(), clock.clone()));
    let admission = Arc::new(AdmissionService::new(settings.clone(), clock.clone()));

    // The LLM provider adapter is wired here by the deployment; without one
    // configured, turns degrade to the fallback message.
    let llm = Arc::new(UnconfiguredLlm);

    let commands = Arc::new(commands::BasicCommands::new(
        sessions.clone(),
        usage.clone(),
        skills.clone(),
        settings.clone(),
    ));

    let mut manager = ChannelManager::new();
    let telegram = Arc::new(TelegramChannel::new(
        settings.clone(),
        admission.clone(),
        Some(commands.clone() as Arc<dyn minder_agent::ports::CommandPort>),
        None,
    ));
    if settings.snapshot().channels.telegram.is_some() {
        manager.register(telegram.clone());
    }
    let channels = Arc::new(manager);

    let deps = Arc::new(TurnDeps {
        settings: settings.clone(),
        clock: clock.clone(),
        sessions: sessions.clone(),
        llm,
        mcp: mcp.clone(),
        usage: usage.clone(),
        skills,
        memory,
        rag: None,
        voice: None,
        confirmations: None,
        channels: channels.clone(),
    });

    let coordinator = TurnCoordinator::new(deps, Pipeline::standard());
    let handler: Arc<dyn InboundHandler> = Arc::new(CoordinatorHandle(coordinator.clone()));
    telegram.on_message(handler.clone());

    // Background sweepers.
    let sweepers = CancellationToken::new();
    tokio::spawn(usage.clone().run_eviction_sweeper(sweepers.clone()));
    tokio::spawn(mcp.clone().run_idle_sweeper(sweepers.clone()));

    channels.start_all().await;

    // Webhook ingress.
    let webhook_state = webhook::WebhookState {
        settings: settings.clone(),
        handler,
    };
    let router = webhook::router(webhook_state);
    let bind = "127.0.0.1:8710";
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, bind, "failed to bind webhook listener");
            return ExitCode::from(2);
        }
    };
    info!(bind, "minder is up");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "webhook server failed");
        }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Stop order: channels first (no new inbound), then the pipeline
    // workers, then MCP subprocesses and sweepers. Usage appends are
    // per-record, so nothing further to flush.
    channels.stop_all().await;
    coordinator.shutdown();
    mcp.stop_all().await;
    sweepers.cancel();
    server.abort();

    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
