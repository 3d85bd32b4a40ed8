use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sea_orm::Database;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use quest_core::config::Config;
use quest_core::health::{Heartbeat, health_router};
use quest_core::tracing::init_tracing;
use quest_events::config::EventsConfig;
use quest_events::domain::types::EventEnvelope;
use quest_events::state::AppState;
use quest_events::usecase::dedup::Deduplicated;

/// Forwards committed outbox events to Redis Streams.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Skip the outbox drain loop (audit consumer only).
    #[arg(long)]
    no_drain: bool,
    /// Log every event of this topic once through the audit consumer group. Repeatable.
    #[arg(long = "audit-topic", value_name = "TOPIC")]
    audit_topics: Vec<String>,
    /// Consumer group used for `--audit-topic`.
    #[arg(long, default_value = "audit")]
    audit_group: String,
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let config = EventsConfig::from_env();
    let registry = config
        .schema_registry()
        .expect("failed to load event schemas");
    info!(schemas = registry.len(), "event schemas loaded");

    let db = Database::connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let redis_cfg = deadpool_redis::Config::from_url(&config.redis_url);
    let redis = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("failed to create Redis pool");

    let state = AppState {
        db,
        redis,
        registry: Arc::new(registry),
        config,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let heartbeat = if args.no_drain {
        // Nothing to go stale; ready as soon as the probes are up.
        let heartbeat = Heartbeat::new(Duration::MAX);
        heartbeat.beat();
        heartbeat
    } else {
        let heartbeat = Heartbeat::new(state.config.stale_after());
        let relay = state.relay(heartbeat.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { relay.run(shutdown).await });
        heartbeat
    };

    let audit = if args.audit_topics.is_empty() {
        None
    } else {
        let events = Arc::new(state.events(&args.audit_group));
        let dedup = Arc::new(state.dedup_store());
        for topic in &args.audit_topics {
            let audit_log = |event: EventEnvelope| async move {
                info!(
                    topic = %event.topic,
                    event_id = %event.id,
                    dedup_key = ?event.dedup_key,
                    payload = %event.payload,
                    "audit"
                );
                anyhow::Ok(())
            };
            let handler = Deduplicated::new(
                Arc::clone(&dedup),
                args.audit_group.clone(),
                state.config.dedup_ttl(),
                audit_log,
            )
            .with_claim_lease(state.config.dedup_claim_lease());
            events.on(topic, handler).expect("invalid --audit-topic");
        }
        let runner = Arc::clone(&events);
        let block_ms = state.config.consumer_block_ms;
        tasks.spawn(async move {
            if let Err(e) = runner.run(Some(block_ms), None).await {
                error!(error = %e.detail(), "audit consumer stopped with error");
            }
        });
        Some(events)
    };

    let addr = format!("0.0.0.0:{}", state.config.relay_health_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");
    info!("relay health probes listening on {addr}");
    let mut server_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        let stopped = async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, health_router(heartbeat))
            .with_graceful_shutdown(stopped)
            .await
        {
            error!(error = %e, "health server error");
        }
    });

    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    if let Some(events) = &audit {
        events.stop();
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "relay task failed");
        }
    }
    info!("relay stopped");
}
