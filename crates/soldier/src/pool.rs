use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use common::{deserialize_message, serialize_message, Broker, Consumer, Mission, MissionStatus, StatusReport};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::token::TokenSource;

/// How simulated work behaves: a uniformly random duration in
/// `[min_work, max_work]` and a fixed chance of failing.
#[derive(Debug, Clone)]
pub struct ExecutionProfile {
    pub min_work: Duration,
    pub max_work: Duration,
    pub failure_rate: f64,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            min_work: Duration::from_secs(5),
            max_work: Duration::from_secs(15),
            failure_rate: 0.1,
        }
    }
}

impl ExecutionProfile {
    pub fn sample_duration(&self) -> Duration {
        let lo = self.min_work.as_millis() as u64;
        let hi = (self.max_work.as_millis() as u64).max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    pub fn sample_outcome(&self) -> MissionStatus {
        if rand::thread_rng().gen::<f64>() < self.failure_rate {
            MissionStatus::Failed
        } else {
            MissionStatus::Completed
        }
    }
}

struct PoolInner {
    soldier: String,
    status_queue: String,
    broker: Arc<dyn Broker>,
    tokens: Arc<dyn TokenSource>,
    profile: ExecutionProfile,
    metrics: Arc<Metrics>,
}

impl PoolInner {
    async fn report(&self, mission_id: &str, status: MissionStatus) {
        let report = StatusReport {
            mission_id: mission_id.to_string(),
            status: status.as_str().to_string(),
            target_worker: self.soldier.clone(),
            token: self.tokens.current().await,
        };
        let body = match serialize_message(&report) {
            Ok(b) => b,
            Err(e) => {
                warn!(mission=%mission_id, error=%e, "status encode failed");
                Metrics::inc(&self.metrics.status_publish_errors_total);
                return;
            }
        };
        match self.broker.publish(&self.status_queue, body).await {
            Ok(()) => {
                Metrics::inc(&self.metrics.status_published_total);
                info!(soldier=%self.soldier, mission=%mission_id, status=%status, "status reported");
            }
            Err(e) => {
                // Lost: status reports are not retried.
                Metrics::inc(&self.metrics.status_publish_errors_total);
                warn!(soldier=%self.soldier, mission=%mission_id, status=%status, error=%e, "status publish failed");
            }
        }
    }

    /// Run one admitted mission. The permit is held until the terminal report is out.
    async fn execute(self: Arc<Self>, mission: Mission, permit: OwnedSemaphorePermit) {
        self.metrics.enter_flight();
        self.report(&mission.mission_id, MissionStatus::InProgress).await;

        let work = self.profile.sample_duration();
        debug!(mission=%mission.mission_id, work=?work, "working");
        tokio::time::sleep(work).await;

        let outcome = self.profile.sample_outcome();
        match outcome {
            MissionStatus::Failed => Metrics::inc(&self.metrics.missions_failed_total),
            _ => Metrics::inc(&self.metrics.missions_completed_total),
        }
        self.report(&mission.mission_id, outcome).await;
        self.metrics.leave_flight();
        drop(permit);
    }
}

/// Upper bound on missions one soldier runs at once.
pub const MAX_CONCURRENCY: usize = 4096;

/// Executes orders from one soldier's queue, at most `capacity` at a time.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    gate: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(
        soldier: String,
        status_queue: String,
        capacity: usize,
        broker: Arc<dyn Broker>,
        tokens: Arc<dyn TokenSource>,
        profile: ExecutionProfile,
        metrics: Arc<Metrics>,
    ) -> Self {
        let capacity = capacity.clamp(1, MAX_CONCURRENCY);
        Self {
            inner: Arc::new(PoolInner {
                soldier,
                status_queue,
                broker,
                tokens,
                profile,
                metrics,
            }),
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decode one order and start it once a slot is free.
    ///
    /// Blocks while the pool is saturated. Undecodable orders are skipped
    /// without taking a slot. Returns whether a mission was started.
    pub async fn admit(&self, body: &[u8]) -> anyhow::Result<bool> {
        Metrics::inc(&self.inner.metrics.orders_received_total);
        let mission: Mission = match deserialize_message(body) {
            Ok(m) => m,
            Err(e) => {
                warn!(soldier=%self.inner.soldier, error=%e, "skipping undecodable order");
                Metrics::inc(&self.inner.metrics.orders_undecodable_total);
                return Ok(false);
            }
        };
        info!(
            soldier=%self.inner.soldier,
            mission=%mission.mission_id,
            target=%mission.target_worker,
            "mission received"
        );

        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("admission gate closed"))?;
        tokio::spawn(self.inner.clone().execute(mission, permit));
        Ok(true)
    }

    /// Wait until every admitted mission has sent its terminal report.
    pub async fn drain(&self) {
        let Ok(permits) = u32::try_from(self.capacity) else {
            return;
        };
        if let Ok(all) = self.gate.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Consume `orders` until `shutdown` resolves or the queue closes, then drain.
    ///
    /// A closed queue is reported as an error after the drain.
    pub async fn run(&self, orders: Consumer, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        info!(soldier=%self.inner.soldier, queue=%orders.queue(), capacity=self.capacity, "worker pool started");
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                msg = orders.next() => match msg {
                    Some(body) => {
                        if let Err(e) = self.admit(&body).await {
                            break Err(e);
                        }
                    }
                    None => break Err(anyhow!("order queue '{}' closed", orders.queue())),
                },
            }
        };
        info!(soldier=%self.inner.soldier, "draining in-flight missions");
        self.drain().await;
        info!(soldier=%self.inner.soldier, "worker pool stopped");
        result
    }
}
