use std::sync::Arc;

use anyhow::anyhow;
use common::{deserialize_message, Consumer, MissionStatus, StatusReport};
use tracing::{info, warn};

use crate::auth::TokenAuthority;
use crate::ledger::MissionLedger;
use crate::metrics::Metrics;

/// What became of a single status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Applied to the snapshot and appended to the history.
    Accepted,
    /// Appended to the history; the snapshot has no such mission.
    AcceptedUnknownMission,
    Undecodable,
    Unauthenticated,
    UnknownStatus(String),
}

/// Consumes status reports, authenticates them and folds them into the ledger.
pub struct Reconciler {
    commander: String,
    ledger: Arc<MissionLedger>,
    authority: Arc<TokenAuthority>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        commander: String,
        ledger: Arc<MissionLedger>,
        authority: Arc<TokenAuthority>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            commander,
            ledger,
            authority,
            metrics,
        }
    }

    /// Drain `consumer` until the channel closes. A closed channel is an error:
    /// the commander cannot recover its status stream.
    pub async fn run(&self, consumer: Consumer) -> anyhow::Result<()> {
        info!(commander=%self.commander, queue=%consumer.queue(), "status reconciler started");
        while let Some(body) = consumer.next().await {
            self.handle(&body).await;
        }
        Err(anyhow!("status queue '{}' closed", consumer.queue()))
    }

    pub async fn handle(&self, body: &[u8]) -> ReportOutcome {
        let report: StatusReport = match deserialize_message(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(commander=%self.commander, error=%e, "discarding undecodable status report");
                Metrics::inc(&self.metrics.reports_undecodable_total);
                return ReportOutcome::Undecodable;
            }
        };
        self.reconcile(report).await
    }

    pub async fn reconcile(&self, report: StatusReport) -> ReportOutcome {
        // Only reports with neither identity nor token skip verification.
        let presents_credentials = !report.target_worker.is_empty() || !report.token.is_empty();
        if presents_credentials && !self.authority.verify(&report.target_worker, &report.token).await {
            warn!(
                commander=%self.commander,
                soldier=%report.target_worker,
                mission=%report.mission_id,
                "invalid token; dropping status report"
            );
            Metrics::inc(&self.metrics.reports_unauthenticated_total);
            return ReportOutcome::Unauthenticated;
        }

        let status: MissionStatus = match report.status.parse() {
            Ok(s) => s,
            Err(e) => {
                warn!(commander=%self.commander, mission=%report.mission_id, error=%e, "dropping status report");
                Metrics::inc(&self.metrics.reports_unknown_status_total);
                return ReportOutcome::UnknownStatus(report.status);
            }
        };

        let worker = Some(report.target_worker.clone()).filter(|w| !w.is_empty());
        let known = self
            .ledger
            .record_status(&report.mission_id, status, worker, None)
            .await;
        Metrics::inc(&self.metrics.reports_accepted_total);
        if known {
            info!(
                commander=%self.commander,
                mission=%report.mission_id,
                status=%status,
                soldier=%report.target_worker,
                "mission updated"
            );
            ReportOutcome::Accepted
        } else {
            warn!(commander=%self.commander, mission=%report.mission_id, status=%status, "status for unknown mission");
            Metrics::inc(&self.metrics.reports_unknown_mission_total);
            ReportOutcome::AcceptedUnknownMission
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{serialize_message, Mission};

    const SECRET: &str = "super_secret";

    struct Fixture {
        reconciler: Reconciler,
        ledger: Arc<MissionLedger>,
        authority: Arc<TokenAuthority>,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MissionLedger::new());
        let authority = Arc::new(TokenAuthority::new(SECRET));
        ledger
            .record_new(
                Mission {
                    mission_id: "m1".to_string(),
                    payload: String::new(),
                    status: MissionStatus::Queued,
                    target_worker: "soldier1".to_string(),
                    assigned_worker: "soldier1".to_string(),
                    commander: "commander1".to_string(),
                },
                "queued",
            )
            .await
            .unwrap();
        let reconciler = Reconciler::new(
            "commander1".to_string(),
            ledger.clone(),
            authority.clone(),
            Arc::new(Metrics::new()),
        );
        Fixture {
            reconciler,
            ledger,
            authority,
        }
    }

    fn report(status: &str, soldier: &str, token: &str) -> StatusReport {
        StatusReport {
            mission_id: "m1".to_string(),
            status: status.to_string(),
            target_worker: soldier.to_string(),
            token: token.to_string(),
        }
    }

    async fn statuses(ledger: &MissionLedger) -> Vec<MissionStatus> {
        ledger.history("m1").await.iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn full_lifecycle_with_rotation_between_reports() {
        let f = fixture().await;
        let t1 = f.authority.rotate("soldier1", SECRET).await.unwrap();
        assert_eq!(
            f.reconciler.reconcile(report("IN_PROGRESS", "soldier1", &t1)).await,
            ReportOutcome::Accepted
        );
        assert_eq!(f.ledger.mission("m1").await.unwrap().status, MissionStatus::InProgress);

        let t2 = f.authority.rotate("soldier1", SECRET).await.unwrap();
        assert_eq!(
            f.reconciler.reconcile(report("COMPLETED", "soldier1", &t2)).await,
            ReportOutcome::Accepted
        );
        assert_eq!(f.ledger.mission("m1").await.unwrap().status, MissionStatus::Completed);
        assert_eq!(
            statuses(&f.ledger).await,
            vec![MissionStatus::Queued, MissionStatus::InProgress, MissionStatus::Completed]
        );
        let last = f.ledger.history("m1").await.pop().unwrap();
        assert_eq!(last.worker.as_deref(), Some("soldier1"));
    }

    #[tokio::test]
    async fn stale_token_after_rotation_is_dropped() {
        let f = fixture().await;
        let old = f.authority.rotate("soldier1", SECRET).await.unwrap();
        f.authority.rotate("soldier1", SECRET).await.unwrap();
        assert_eq!(
            f.reconciler.reconcile(report("IN_PROGRESS", "soldier1", &old)).await,
            ReportOutcome::Unauthenticated
        );
        assert_eq!(f.ledger.mission("m1").await.unwrap().status, MissionStatus::Queued);
        assert_eq!(statuses(&f.ledger).await, vec![MissionStatus::Queued]);
    }

    #[tokio::test]
    async fn empty_token_without_issued_digest_is_dropped() {
        let f = fixture().await;
        assert_eq!(
            f.reconciler.reconcile(report("COMPLETED", "soldier1", "")).await,
            ReportOutcome::Unauthenticated
        );
        assert_eq!(f.ledger.mission("m1").await.unwrap().status, MissionStatus::Queued);
        assert_eq!(f.ledger.history("m1").await.len(), 1);
    }

    #[tokio::test]
    async fn token_for_another_soldier_is_dropped() {
        let f = fixture().await;
        f.authority.rotate("soldier1", SECRET).await.unwrap();
        let other = f.authority.rotate("soldier2", SECRET).await.unwrap();
        assert_eq!(
            f.reconciler.reconcile(report("COMPLETED", "soldier1", &other)).await,
            ReportOutcome::Unauthenticated
        );
    }

    #[tokio::test]
    async fn unknown_status_is_rejected_without_side_effects() {
        let f = fixture().await;
        let t = f.authority.rotate("soldier1", SECRET).await.unwrap();
        assert_eq!(
            f.reconciler.reconcile(report("DONE", "soldier1", &t)).await,
            ReportOutcome::UnknownStatus("DONE".to_string())
        );
        let m = f.ledger.mission("m1").await.unwrap();
        assert_eq!(m.status, MissionStatus::Queued);
        assert_eq!(statuses(&f.ledger).await, vec![MissionStatus::Queued]);
    }

    #[tokio::test]
    async fn internal_reports_bypass_verification() {
        let f = fixture().await;
        assert_eq!(
            f.reconciler.reconcile(report("FAILED", "", "")).await,
            ReportOutcome::Accepted
        );
        let m = f.ledger.mission("m1").await.unwrap();
        assert_eq!(m.status, MissionStatus::Failed);
        // No reporting worker, so attribution is untouched.
        assert_eq!(m.assigned_worker, "soldier1");
    }

    #[tokio::test]
    async fn redelivered_terminal_report_is_appended_again() {
        let f = fixture().await;
        let t = f.authority.rotate("soldier1", SECRET).await.unwrap();
        f.reconciler.reconcile(report("COMPLETED", "soldier1", &t)).await;
        f.reconciler.reconcile(report("COMPLETED", "soldier1", &t)).await;
        assert_eq!(f.ledger.mission("m1").await.unwrap().status, MissionStatus::Completed);
        assert_eq!(
            statuses(&f.ledger).await,
            vec![MissionStatus::Queued, MissionStatus::Completed, MissionStatus::Completed]
        );
    }

    #[tokio::test]
    async fn garbage_bytes_are_discarded() {
        let f = fixture().await;
        assert_eq!(f.reconciler.handle(b"{not json").await, ReportOutcome::Undecodable);
        let t = f.authority.rotate("soldier1", SECRET).await.unwrap();
        let body = serialize_message(&report("IN_PROGRESS", "soldier1", &t)).unwrap();
        assert_eq!(f.reconciler.handle(&body).await, ReportOutcome::Accepted);
    }

    #[tokio::test]
    async fn unknown_mission_is_history_only() {
        let f = fixture().await;
        let t = f.authority.rotate("soldier1", SECRET).await.unwrap();
        let mut r = report("COMPLETED", "soldier1", &t);
        r.mission_id = "ghost".to_string();
        assert_eq!(f.reconciler.reconcile(r).await, ReportOutcome::AcceptedUnknownMission);
        assert!(f.ledger.mission("ghost").await.is_none());
        assert_eq!(f.ledger.history("ghost").await.len(), 1);
    }

    #[tokio::test]
    async fn run_applies_queued_reports() {
        use common::{Broker, MemoryBroker};
        let f = fixture().await;
        let broker = MemoryBroker::new();
        broker.declare_queue("status_commander1").await.unwrap();
        let t = f.authority.rotate("soldier1", SECRET).await.unwrap();
        broker
            .publish(
                "status_commander1",
                serialize_message(&report("IN_PROGRESS", "soldier1", &t)).unwrap(),
            )
            .await
            .unwrap();
        let consumer = broker.consume("status_commander1").await.unwrap();

        let reconciler = Arc::new(f.reconciler);
        let r = reconciler.clone();
        let task = tokio::spawn(async move { r.run(consumer).await });
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while f.ledger.mission("m1").await.unwrap().status != MissionStatus::InProgress {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("report applied");
        task.abort();
    }
}
