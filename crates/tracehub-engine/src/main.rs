//! TraceHub engine process.
//!
//! Runs the hub against the in-memory stores: the periodic timers plus a
//! loop draining backfill requests, until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tracehub_core::TaskType;
use tracehub_engine::filter_builder::DefaultFilterBuilder;
use tracehub_engine::{
    ChannelBackfillProducer, Clock, Collaborators, Config, HandlerRegistry, MemoryLock,
    MemorySpanStore, MemoryTaskRepository, StoreHandler, SystemClock, TraceHub,
};

/// TraceHub task orchestration engine.
#[derive(Parser, Debug)]
#[command(name = "tracehub", about = "TraceHub task orchestration engine")]
struct Args {
    /// Seconds between status reconciliation sweeps
    #[arg(long, default_value = "300")]
    reconcile_interval_secs: u64,

    /// Seconds between run counter synchronizations
    #[arg(long, default_value = "120")]
    counter_sync_interval_secs: u64,

    /// Seconds between task cache refreshes
    #[arg(long, default_value = "60")]
    cache_refresh_interval_secs: u64,

    /// Spans per backfill page
    #[arg(long, default_value = "500")]
    backfill_page_size: usize,

    /// Buffered backfill requests
    #[arg(long, default_value = "128")]
    backfill_queue: usize,

    /// Log filter, e.g. "info" or "tracehub_engine=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .with_target(true)
        .init();

    let config = Config {
        reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
        counter_sync_interval: Duration::from_secs(args.counter_sync_interval_secs),
        cache_refresh_interval: Duration::from_secs(args.cache_refresh_interval_secs),
        backfill_page_size: args.backfill_page_size,
        ..Config::default()
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let repo = Arc::new(MemoryTaskRepository::new(clock.clone()));
    let store_handler = Arc::new(StoreHandler::new(repo.clone(), clock.clone()));
    let handlers = HandlerRegistry::new()
        .register(TaskType::AutoEvaluate, store_handler.clone())
        .register(TaskType::AutoDataReflow, store_handler);
    let (producer, mut backfill_rx) = ChannelBackfillProducer::new(args.backfill_queue);

    let hub = TraceHub::new(
        config,
        Collaborators {
            repo,
            spans: Arc::new(MemorySpanStore::new()),
            lock: Arc::new(MemoryLock::new(clock.clone())),
            producer: Arc::new(producer),
            filters: Arc::new(DefaultFilterBuilder),
            handlers,
            clock,
        },
    );

    info!(
        reconcile_secs = args.reconcile_interval_secs,
        counter_sync_secs = args.counter_sync_interval_secs,
        cache_refresh_secs = args.cache_refresh_interval_secs,
        "Starting TraceHub engine"
    );

    let shutdown = CancellationToken::new();
    let mut handles = hub.start(shutdown.clone());

    let drain_hub = hub.clone();
    let drain_token = shutdown.clone();
    handles.push(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = drain_token.cancelled() => break,
                event = backfill_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = drain_hub.on_backfill_request(&event).await {
                warn!(task_id = %event.task_id, error = %e, "Backfill request failed");
            }
        }
        info!("Backfill consumer stopped");
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("TraceHub engine stopped");
    Ok(())
}
