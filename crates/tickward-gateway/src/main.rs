use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tickward_core::config::TickwardConfig;
use tickward_scheduler::{next_fire_time, Scheduler};
use tracing::{info, warn};

mod app;
mod cli;
mod http;
mod signal;
mod store;
mod tasks;

use cli::{Cli, Commands};
use store::StoreHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tickward_gateway=info,tickward_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config / TICKWARD_CONFIG > ~/.tickward/tickward.toml
    let config = TickwardConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TickwardConfig::default()
    });

    match cli.command.unwrap_or(Commands::Run { bind: None, port: None }) {
        Commands::Check => check(&config),
        Commands::Run { bind, port } => run(config, bind, port).await,
    }
}

async fn run(mut config: TickwardConfig, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let store = StoreHandle::open(&config.store)?;

    // Execution records: Scheduler → AppState.last_runs
    let (records_tx, records_rx) = tokio::sync::mpsc::channel(256);
    let mut builder = Scheduler::builder()
        .config(&config.scheduler)
        .record_sink(records_tx);
    if config.scheduler.distributed_lock {
        builder = builder.distributed_lock_shared(store.lease_store());
    } else {
        warn!("distributed lock disabled; ticks are only exclusive within this process");
    }
    let scheduler = builder.build();

    let registered = tasks::register_builtin(&scheduler, &store, &config.tasks)?;
    info!(tasks = ?registered, "built-in tasks registered");

    let drain_timeout = config.scheduler.drain_timeout();
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;

    let state = Arc::new(app::AppState::new(scheduler.clone(), store));
    app::spawn_record_collector(Arc::clone(&state), records_rx);
    let router = app::build_router(state);

    scheduler.start()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Tickward gateway listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(signal::shutdown_signal())
        .await?;

    info!("HTTP server stopped, shutting down scheduler");
    scheduler.stop().await;
    if scheduler.drain(drain_timeout).await {
        info!("all executions finished");
    } else {
        warn!(
            in_flight = scheduler.in_flight(),
            "exiting with executions still running; their leases will expire on their own"
        );
    }
    Ok(())
}

/// Resolve the task table against `config` and print it.
fn check(config: &TickwardConfig) -> anyhow::Result<()> {
    let defaults = Scheduler::builder().config(&config.scheduler).build().default_options();
    let resolved = tasks::resolve(&config.tasks, &defaults)?;
    let now = chrono::Utc::now();

    println!(
        "store: {:?}  distributed_lock: {}",
        config.store.kind, config.scheduler.distributed_lock
    );
    for task in resolved {
        let next = next_fire_time(task.schedule.expr(), now)?;
        println!(
            "{:<16} {:<18} next={}  lease={}s  timeout={}  immediate={}",
            task.name,
            task.schedule.expr(),
            next.to_rfc3339(),
            task.options.lease_duration.as_secs(),
            task.options
                .timeout
                .map(|t| format!("{}s", t.as_secs()))
                .unwrap_or_else(|| "none".into()),
            task.options.run_immediately,
        );
    }
    Ok(())
}
