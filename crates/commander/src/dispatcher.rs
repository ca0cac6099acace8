use std::sync::Arc;

use common::{orders_queue, serialize_message, validate_identity, Broker, Mission, MissionStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::MissionError;
use crate::ledger::{MissionLedger, StatusEvent};
use crate::metrics::Metrics;

pub const QUEUED_MESSAGE: &str = "Mission received and queued";

/// Accepts mission submissions and routes each one to its soldier's order queue.
pub struct Dispatcher {
    commander: String,
    broker: Arc<dyn Broker>,
    ledger: Arc<MissionLedger>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        commander: String,
        broker: Arc<dyn Broker>,
        ledger: Arc<MissionLedger>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            commander,
            broker,
            ledger,
            metrics,
        }
    }

    pub fn commander(&self) -> &str {
        &self.commander
    }

    /// Queue `payload` for `target_soldier` and return the new mission id.
    pub async fn submit(&self, payload: String, target_soldier: &str) -> Result<String, MissionError> {
        if target_soldier.is_empty() {
            return Err(MissionError::Validation("target_worker is required".to_string()));
        }
        validate_identity(target_soldier)?;

        let queue = orders_queue(&self.commander, target_soldier);
        if let Err(e) = self.broker.declare_outbound(&queue).await {
            warn!(queue=%queue, error=%e, "order queue declare failed");
            Metrics::inc(&self.metrics.dispatch_errors_total);
            return Err(MissionError::Routing(e));
        }

        let mission = Mission {
            mission_id: Uuid::new_v4().to_string(),
            payload,
            status: MissionStatus::Queued,
            target_worker: target_soldier.to_string(),
            assigned_worker: target_soldier.to_string(),
            commander: self.commander.clone(),
        };
        let body = serialize_message(&mission)?;
        let mission_id = mission.mission_id.clone();

        // Recorded before publishing so a fast status report always finds its mission.
        self.ledger.record_new(mission, QUEUED_MESSAGE).await?;

        if let Err(e) = self.broker.publish(&queue, body).await {
            warn!(mission=%mission_id, queue=%queue, error=%e, "order publish failed");
            Metrics::inc(&self.metrics.dispatch_errors_total);
            self.ledger
                .record_status(
                    &mission_id,
                    MissionStatus::Failed,
                    None,
                    Some(format!("dispatch failed: {e}")),
                )
                .await;
            return Err(MissionError::Publish(e));
        }

        Metrics::inc(&self.metrics.missions_submitted_total);
        info!(commander=%self.commander, mission=%mission_id, soldier=%target_soldier, queue=%queue, "mission submitted");
        Ok(mission_id)
    }

    pub async fn lookup(&self, mission_id: &str) -> Result<Mission, MissionError> {
        self.ledger
            .mission(mission_id)
            .await
            .ok_or_else(|| MissionError::NotFound(format!("mission '{mission_id}' not found")))
    }

    pub async fn list_all(&self) -> Vec<Mission> {
        self.ledger.missions().await
    }

    pub async fn history(&self, mission_id: &str) -> Result<Vec<StatusEvent>, MissionError> {
        let events = self.ledger.history(mission_id).await;
        if events.is_empty() {
            return Err(MissionError::NotFound(format!(
                "mission '{mission_id}' not found or has no history"
            )));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{deserialize_message, BrokerError, Consumer, MemoryBroker};
    use std::collections::HashSet;

    fn dispatcher(broker: Arc<dyn Broker>) -> (Dispatcher, Arc<MissionLedger>) {
        let ledger = Arc::new(MissionLedger::new());
        let d = Dispatcher::new(
            "commander1".to_string(),
            broker,
            ledger.clone(),
            Arc::new(Metrics::new()),
        );
        (d, ledger)
    }

    /// Broker that refuses either declares or publishes.
    struct BrokenBroker {
        fail_declare: bool,
    }

    #[async_trait]
    impl Broker for BrokenBroker {
        async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
            if self.fail_declare {
                Err(BrokerError::Declare {
                    queue: queue.to_string(),
                    reason: "channel closed".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn publish(&self, queue: &str, _body: Vec<u8>) -> Result<(), BrokerError> {
            Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "channel closed".to_string(),
            })
        }

        async fn consume(&self, _queue: &str) -> Result<Consumer, BrokerError> {
            Err(BrokerError::Closed)
        }
    }

    #[tokio::test]
    async fn submit_routes_order_to_soldier_queue() {
        let broker = MemoryBroker::new();
        let (d, _) = dispatcher(Arc::new(broker.clone()));
        let id = d.submit("recon grid 7".to_string(), "soldier1").await.unwrap();

        let consumer = broker.consume("orders_commander1_soldier1").await.unwrap();
        let order: Mission = deserialize_message(&consumer.next().await.unwrap()).unwrap();
        assert_eq!(order.mission_id, id);
        assert_eq!(order.status, MissionStatus::Queued);
        assert_eq!(order.payload, "recon grid 7");
        assert_eq!(order.commander, "commander1");
        assert_eq!(order.assigned_worker, "soldier1");
    }

    #[tokio::test]
    async fn lookup_after_submit_is_queued_and_ids_are_unique() {
        let (d, _) = dispatcher(Arc::new(MemoryBroker::new()));
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let id = d.submit(String::new(), "soldier1").await.unwrap();
            assert!(!id.is_empty());
            assert!(seen.insert(id.clone()), "duplicate id {id}");
            assert_eq!(d.lookup(&id).await.unwrap().status, MissionStatus::Queued);
        }
        assert_eq!(d.list_all().await.len(), 50);
    }

    #[tokio::test]
    async fn queued_event_has_no_worker_attribution() {
        let (d, _) = dispatcher(Arc::new(MemoryBroker::new()));
        let id = d.submit("p".to_string(), "soldier1").await.unwrap();
        let history = d.history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MissionStatus::Queued);
        assert_eq!(history[0].worker, None);
        assert_eq!(history[0].message.as_deref(), Some(QUEUED_MESSAGE));
    }

    #[tokio::test]
    async fn empty_target_is_a_validation_error() {
        let broker = MemoryBroker::new();
        let (d, ledger) = dispatcher(Arc::new(broker.clone()));
        assert!(matches!(
            d.submit("p".to_string(), "").await,
            Err(MissionError::Validation(_))
        ));
        assert!(matches!(
            d.submit("p".to_string(), "sol_dier").await,
            Err(MissionError::Validation(_))
        ));
        assert_eq!(ledger.mission_count().await, 0);
        assert!(broker.queue_names().await.is_empty());
    }

    #[tokio::test]
    async fn declare_failure_is_a_routing_error_and_records_nothing() {
        let (d, ledger) = dispatcher(Arc::new(BrokenBroker { fail_declare: true }));
        assert!(matches!(
            d.submit("p".to_string(), "soldier1").await,
            Err(MissionError::Routing(_))
        ));
        assert_eq!(ledger.mission_count().await, 0);
    }

    #[tokio::test]
    async fn publish_failure_marks_mission_failed() {
        let (d, ledger) = dispatcher(Arc::new(BrokenBroker { fail_declare: false }));
        assert!(matches!(
            d.submit("p".to_string(), "soldier1").await,
            Err(MissionError::Publish(_))
        ));
        let missions = ledger.missions().await;
        assert_eq!(missions.len(), 1);
        assert_eq!(missions[0].status, MissionStatus::Failed);
        let history = ledger.history(&missions[0].mission_id).await;
        let statuses: Vec<_> = history.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![MissionStatus::Queued, MissionStatus::Failed]);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (d, _) = dispatcher(Arc::new(MemoryBroker::new()));
        assert!(matches!(d.lookup("nope").await, Err(MissionError::NotFound(_))));
        assert!(matches!(d.history("nope").await, Err(MissionError::NotFound(_))));
    }
}
