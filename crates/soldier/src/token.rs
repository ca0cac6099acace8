//! Soldier-side token cache with a best-effort background refresh.
//!
//! A refresh failure never blocks mission execution: reports keep carrying
//! whatever token was last obtained, even if the commander will reject it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

pub const SECRET_HEADER: &str = "X-SECRET";
pub const SOLDIER_HEADER: &str = "X-SOLDIER";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("commander answered {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed token response: {0}")]
    Decode(String),
    #[error("commander returned an empty token")]
    EmptyToken,
}

/// Anything that can hand out the token to attach to a status report.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current plaintext token; empty if none has been obtained yet.
    async fn current(&self) -> String;
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Default)]
struct CachedToken {
    plaintext: String,
    expires_at: Option<Instant>,
}

pub struct TokenClient {
    http: reqwest::Client,
    refresh_url: String,
    soldier: String,
    secret: String,
    ttl: Duration,
    cached: Mutex<CachedToken>,
    metrics: Arc<Metrics>,
}

impl TokenClient {
    /// `commander_url` is the commander's base URL, e.g. `http://commander1:8080`.
    pub fn new(
        commander_url: &str,
        soldier: &str,
        secret: &str,
        ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            refresh_url: format!("{}/auth/refresh_token", commander_url.trim_end_matches('/')),
            soldier: soldier.to_string(),
            secret: secret.to_string(),
            ttl,
            cached: Mutex::new(CachedToken::default()),
            metrics,
        })
    }

    /// True when no token is cached or the cached one is past its TTL.
    pub async fn needs_refresh(&self) -> bool {
        let cached = self.cached.lock().await;
        if cached.plaintext.is_empty() {
            return true;
        }
        cached.expires_at.map_or(true, |at| Instant::now() >= at)
    }

    /// Ask the commander for a fresh token and cache it.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let resp = self
            .http
            .post(&self.refresh_url)
            .header(SECRET_HEADER, &self.secret)
            .header(SOLDIER_HEADER, &self.soldier)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RefreshError::Status(resp.status()));
        }
        let bytes = resp.bytes().await?;
        let body: TokenBody =
            serde_json::from_slice(&bytes).map_err(|e| RefreshError::Decode(e.to_string()))?;
        if body.token.is_empty() {
            return Err(RefreshError::EmptyToken);
        }

        // The lock is only taken once the response is in hand.
        let mut cached = self.cached.lock().await;
        cached.plaintext = body.token;
        cached.expires_at = Some(Instant::now() + self.ttl);
        Ok(())
    }

    /// One refresh-loop step: refresh if needed, log and count the result.
    pub async fn tick(&self) {
        if !self.needs_refresh().await {
            return;
        }
        match self.refresh().await {
            Ok(()) => {
                Metrics::inc(&self.metrics.token_refresh_ok_total);
                info!(soldier=%self.soldier, ttl=?self.ttl, "token rotated");
            }
            Err(e) => {
                Metrics::inc(&self.metrics.token_refresh_failed_total);
                warn!(soldier=%self.soldier, error=%e, "token refresh failed; retrying next tick");
            }
        }
    }

    /// Run [`tick`](Self::tick) every `interval` until the handle is stopped.
    pub fn spawn_refresh_loop(self: Arc<Self>, interval: Duration) -> RefreshHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }
            debug!(soldier=%self.soldier, "token refresh loop stopped");
        });
        RefreshHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

#[async_trait]
impl TokenSource for TokenClient {
    async fn current(&self) -> String {
        self.cached.lock().await.plaintext.clone()
    }
}

pub struct RefreshHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
