//! Group-buy reservation worker.
//!
//! Runs the expiry sweeper and the settlement payout batch against
//! `PostgreSQL`, serves Prometheus metrics and reloads the policy bundle
//! on SIGHUP.

use anyhow::Context;
use groupbuy_core::environment::{Clock, SystemClock};
use groupbuy_core::policy::{PolicyBundle, PolicyHandle};
use groupbuy_core::store::ReservationStore;
use groupbuy_postgres::PostgresStore;
use groupbuy_reservations::{Config, ExpirySweeper, ReservationMachine, SettlementBatcher};
use groupbuy_runtime::metrics::MetricsServer;
use groupbuy_runtime::{Shutdown, shutdown_signal};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,groupbuy=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting group-buy reservation worker");

    let config = Config::from_env();
    info!(
        sweeper_interval_secs = config.sweeper.interval_secs,
        settlement_enabled = config.settlement.enabled,
        policy_path = ?config.policy_path,
        "Configuration loaded"
    );

    // Database
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let postgres = PostgresStore::from_pool(pool);
    postgres.migrate().await?;
    let store: Arc<dyn ReservationStore> = Arc::new(postgres);
    info!("Store ready");

    // Policy
    let policy = Arc::new(match &config.policy_path {
        Some(path) => PolicyHandle::new(PolicyBundle::from_path(path)?)?,
        None => PolicyHandle::default(),
    });
    info!(policy_version = %policy.current().version, "Policy loaded");

    // Metrics
    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let machine = Arc::new(ReservationMachine::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        Arc::clone(&policy),
    ));

    let mut shutdown = Shutdown::new();
    Arc::new(ExpirySweeper::new(
        machine,
        Arc::clone(&clock),
        config.sweeper.batch_limit,
    ))
    .spawn(&mut shutdown, config.sweeper_interval());

    if config.settlement.enabled {
        Arc::new(SettlementBatcher::new(Arc::clone(&store), Arc::clone(&clock))).spawn(
            &mut shutdown,
            config.settlement_interval(),
            config.settlement.batch_limit,
        );
    }

    let reloader = config
        .policy_path
        .clone()
        .map(|path| tokio::spawn(reload_on_sighup(Arc::clone(&policy), path)));

    info!(tasks = shutdown.task_count(), "Worker running");
    shutdown_signal().await;

    info!("Shutting down");
    if let Some(reloader) = reloader {
        reloader.abort();
    }
    shutdown.join(config.shutdown_timeout()).await;
    info!("Worker stopped");
    Ok(())
}

/// Reload the policy bundle from `path` on every SIGHUP.
///
/// A bundle that fails validation is logged and the active one stays.
#[cfg(unix)]
async fn reload_on_sighup(policy: Arc<PolicyHandle>, path: String) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match policy.reload_from_path(&path) {
            Ok(()) => info!(path = %path, "Policy reloaded"),
            Err(e) => tracing::error!(path = %path, error = %e, "Policy reload rejected"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(_policy: Arc<PolicyHandle>, _path: String) {}
