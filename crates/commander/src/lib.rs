//! Mission commander: accepts missions over HTTP, routes them to soldier
//! order queues, issues soldier tokens, and folds authenticated status
//! reports into the mission ledger.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reconciler;
pub mod web;

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use common::{declare_with_retry, status_queue, Broker};
use tracing::info;

pub use auth::TokenAuthority;
pub use config::CommanderConfig;
pub use dispatcher::Dispatcher;
pub use error::MissionError;
pub use ledger::{MissionLedger, StatusEvent};
pub use metrics::Metrics;
pub use reconciler::{ReportOutcome, Reconciler};

/// Every commander component wired to one broker.
pub struct Commander {
    config: CommanderConfig,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    authority: Arc<TokenAuthority>,
    ledger: Arc<MissionLedger>,
    metrics: Arc<Metrics>,
}

impl Commander {
    pub fn new(config: CommanderConfig, broker: Arc<dyn Broker>) -> Self {
        let ledger = Arc::new(MissionLedger::new());
        let metrics = Arc::new(Metrics::new());
        let authority = Arc::new(TokenAuthority::new(&config.rotation_secret));
        let dispatcher = Arc::new(Dispatcher::new(
            config.name.clone(),
            broker.clone(),
            ledger.clone(),
            metrics.clone(),
        ));
        Self {
            config,
            broker,
            dispatcher,
            authority,
            ledger,
            metrics,
        }
    }

    pub fn web_state(&self) -> web::WebState {
        web::WebState {
            dispatcher: self.dispatcher.clone(),
            authority: self.authority.clone(),
            ledger: self.ledger.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.config.name.clone(),
            self.ledger.clone(),
            self.authority.clone(),
            self.metrics.clone(),
        )
    }

    /// Declare the status queue, start the reconciler and serve the API until
    /// `shutdown` resolves. Returns early with an error if the status stream
    /// closes.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let queue = status_queue(&self.config.name);
        declare_with_retry(self.broker.as_ref(), &queue, self.config.broker_retry()).await;
        let consumer = self
            .broker
            .consume(&queue)
            .await
            .map_err(|e| anyhow!("consuming {queue}: {e}"))?;

        let reconciler = self.reconciler();
        let mut reconcile_task = tokio::spawn(async move { reconciler.run(consumer).await });
        let reconcile_abort = reconcile_task.abort_handle();

        info!(commander=%self.config.name, bind=%self.config.bind, "commander starting");
        let server = web::serve(self.config.bind, self.web_state(), shutdown);
        tokio::select! {
            res = server => {
                reconcile_abort.abort();
                res
            }
            res = &mut reconcile_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow!("status reconciler task failed: {e}")),
            },
        }
    }
}

/// Build a commander on `broker` and run it until `shutdown` resolves.
pub async fn run_commander(
    config: CommanderConfig,
    broker: Arc<dyn Broker>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    config.validate()?;
    Commander::new(config, broker).run(shutdown).await
}
