//! Spool bus node.
//!
//! Runs one dispatcher against the shared PostgreSQL entry table until
//! Ctrl-C or SIGTERM, then shuts down gracefully and releases its claims.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spool_core::{CommitNotifier, PostgresEntryStore};
use spool_dispatch::{
    BusEvent, Config, DispatchContext, Dispatcher, EventHandler, HandlerError, HandlerRegistry,
    PersistentQueueMode,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

/// Free-form message written to the node log when dispatched.
#[derive(Debug, Serialize, Deserialize)]
struct LogMessage {
    message: String,
}

impl BusEvent for LogMessage {
    const EVENT_TYPE: &'static str = "spool.log";
}

struct LoggingHandler;

#[async_trait]
impl EventHandler<LogMessage> for LoggingHandler {
    async fn handle(&self, event: LogMessage, ctx: &DispatchContext) -> Result<(), HandlerError> {
        info!(
            entry_id = %ctx.entry_id,
            creating_owner = %ctx.creating_owner,
            error_count = ctx.error_count,
            message = %event.message,
            "bus message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    let node_id = config.node_id();
    info!(
        %node_id,
        database_url = %config.redacted_database_url(),
        mode = %config.mode,
        max_connections = config.database_max_connections,
        "starting spool node"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    let notifier = CommitNotifier::new();
    let store = PostgresEntryStore::new(pool.clone(), config.table_names())?
        .with_notifier(notifier.clone());
    store.ensure_schema().await.context("failed to ensure entry tables")?;
    info!(table = %config.table_name, history = %config.history_table_name, "entry tables ready");

    let registry = HandlerRegistry::new().with_handler::<LogMessage, _>(LoggingHandler);
    let mut dispatcher =
        Dispatcher::new(node_id, Arc::new(store), registry, config.to_dispatch_config())?;
    if config.mode == PersistentQueueMode::StickyEvents {
        dispatcher = dispatcher.with_notifier(notifier);
    }
    dispatcher.start().await?;
    info!("spool node is ready");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = dispatcher.stats().await;
    if let Err(e) = dispatcher.shutdown().await {
        error!(error = %e, "dispatcher shutdown incomplete");
    }
    info!(
        claimed = stats.claimed,
        processed = stats.processed,
        retried = stats.retried,
        failed = stats.failed,
        reaped = stats.reaped,
        "dispatcher stopped"
    );

    pool.close().await;
    info!("spool node shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` from the process environment.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
