//! Mission state owned by the commander: the latest-state snapshot table and
//! the append-only per-mission history.
//!
//! Each store guards its own map and only hands out copies. All writes go
//! through [`MissionLedger`], which holds the snapshot lock while it appends
//! the matching event, so the snapshot status is always the status of the
//! last event appended for that mission. Locks are always taken snapshot
//! first, then history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{Mission, MissionStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::MissionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub status: MissionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn now(status: MissionStatus, worker: Option<String>, message: Option<String>) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            worker,
            message,
        }
    }
}

#[derive(Default)]
pub struct MissionStore {
    missions: Mutex<HashMap<String, Mission>>,
}

/// Record a status (and reporting worker, if any). Returns false for unknown ids.
fn apply_status(
    missions: &mut HashMap<String, Mission>,
    mission_id: &str,
    status: MissionStatus,
    worker: Option<&str>,
) -> bool {
    match missions.get_mut(mission_id) {
        Some(mission) => {
            mission.status = status;
            if let Some(w) = worker.filter(|w| !w.is_empty()) {
                mission.target_worker = w.to_string();
                mission.assigned_worker = w.to_string();
            }
            true
        }
        None => false,
    }
}

impl MissionStore {
    pub async fn get(&self, mission_id: &str) -> Option<Mission> {
        self.missions.lock().await.get(mission_id).cloned()
    }

    /// Copy of every mission, in no particular order.
    pub async fn list(&self) -> Vec<Mission> {
        self.missions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.missions.lock().await.len()
    }
}

#[derive(Default)]
pub struct HistoryStore {
    events: RwLock<HashMap<String, Vec<StatusEvent>>>,
}

impl HistoryStore {
    /// Events for `mission_id` in append order. Empty when nothing was recorded.
    pub async fn history(&self, mission_id: &str) -> Vec<StatusEvent> {
        self.events
            .read()
            .await
            .get(mission_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MissionLedger {
    missions: MissionStore,
    history: HistoryStore,
}

impl MissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly dispatched mission together with its first event.
    pub async fn record_new(&self, mission: Mission, message: &str) -> Result<(), MissionError> {
        let mut missions = self.missions.missions.lock().await;
        if missions.contains_key(&mission.mission_id) {
            return Err(MissionError::Internal(format!(
                "duplicate mission id {}",
                mission.mission_id
            )));
        }
        let event = StatusEvent::now(mission.status, None, Some(message.to_string()));
        let mut events = self.history.events.write().await;
        events.entry(mission.mission_id.clone()).or_default().push(event);
        missions.insert(mission.mission_id.clone(), mission);
        Ok(())
    }

    /// Apply an accepted status to the snapshot and append it to the history.
    ///
    /// The event is appended even when the mission is unknown to the snapshot;
    /// the return value tells the caller whether the snapshot was updated.
    pub async fn record_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
        worker: Option<String>,
        message: Option<String>,
    ) -> bool {
        let mut missions = self.missions.missions.lock().await;
        let known = apply_status(&mut missions, mission_id, status, worker.as_deref());
        let mut events = self.history.events.write().await;
        events
            .entry(mission_id.to_string())
            .or_default()
            .push(StatusEvent::now(status, worker, message));
        known
    }

    pub async fn mission(&self, mission_id: &str) -> Option<Mission> {
        self.missions.get(mission_id).await
    }

    pub async fn missions(&self) -> Vec<Mission> {
        self.missions.list().await
    }

    pub async fn history(&self, mission_id: &str) -> Vec<StatusEvent> {
        self.history.history(mission_id).await
    }

    pub async fn mission_count(&self) -> usize {
        self.missions.len().await
    }
}
