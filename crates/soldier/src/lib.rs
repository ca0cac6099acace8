//! Soldier worker: consumes its order queue, simulates each mission under a
//! bounded worker pool, and reports status to its commander with a rotating
//! token.

pub mod config;
pub mod metrics;
pub mod pool;
pub mod token;

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use common::{declare_outbound_with_retry, declare_with_retry, orders_queue, status_queue, Broker};
use tracing::info;

pub use config::SoldierConfig;
pub use metrics::Metrics;
pub use pool::{ExecutionProfile, WorkerPool};
pub use token::{RefreshError, TokenClient, TokenSource};

/// Run a soldier on `broker` until `shutdown` resolves or its order queue closes.
pub async fn run_soldier(
    config: SoldierConfig,
    broker: Arc<dyn Broker>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    config.validate()?;
    let metrics = Arc::new(Metrics::new());

    let metrics_task = config
        .metrics_bind
        .map(|addr| tokio::spawn(metrics::serve_metrics(metrics.clone(), addr)));

    let tokens = Arc::new(TokenClient::new(
        &config.commander_url(),
        &config.name,
        &config.rotation_secret,
        config.token_ttl(),
        metrics.clone(),
    )?);
    let refresher = tokens.clone().spawn_refresh_loop(config.token_refresh_interval());

    let orders = orders_queue(&config.commander, &config.name);
    let status = status_queue(&config.commander);
    declare_with_retry(broker.as_ref(), &orders, config.broker_retry()).await;
    declare_outbound_with_retry(broker.as_ref(), &status, config.broker_retry()).await;
    let consumer = broker
        .consume(&orders)
        .await
        .map_err(|e| anyhow!("consuming {orders}: {e}"))?;

    info!(
        soldier=%config.name,
        commander=%config.commander,
        orders=%orders,
        status=%status,
        "soldier starting"
    );
    let pool = WorkerPool::new(
        config.name.clone(),
        status,
        config.concurrency,
        broker,
        tokens,
        config.profile(),
        metrics,
    );
    let result = pool.run(consumer, shutdown).await;

    refresher.stop().await;
    if let Some(task) = metrics_task {
        task.abort();
    }
    result
}
