use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use common::{validate_identity, MeshConfig};
use serde::{Deserialize, Serialize};

use crate::pool::{ExecutionProfile, MAX_CONCURRENCY};

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoldierConfig {
    /// Required; there is no sensible default identity.
    pub name: String,
    pub commander: String,
    /// Commander base URL. Defaults to `http://{commander}:8080`.
    pub commander_url: Option<String>,
    pub rotation_secret: String,
    pub concurrency: usize,
    pub token_refresh_secs: u64,
    pub token_ttl_secs: u64,
    pub min_work_secs: u64,
    pub max_work_secs: u64,
    pub failure_rate: f64,
    pub metrics_bind: Option<SocketAddr>,
    pub broker_retry_secs: u64,
    pub mesh: MeshConfig,
}

impl Default for SoldierConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            commander: "commander1".to_string(),
            commander_url: None,
            rotation_secret: "super_secret".to_string(),
            concurrency: 2,
            token_refresh_secs: 2,
            token_ttl_secs: 30,
            min_work_secs: 5,
            max_work_secs: 15,
            failure_rate: 0.1,
            metrics_bind: None,
            broker_retry_secs: 3,
            mesh: MeshConfig::default(),
        }
    }
}

impl std::fmt::Debug for SoldierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoldierConfig")
            .field("name", &self.name)
            .field("commander", &self.commander)
            .field("commander_url", &self.commander_url())
            .field("rotation_secret", &"<redacted>")
            .field("concurrency", &self.concurrency)
            .field("token_refresh_secs", &self.token_refresh_secs)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("min_work_secs", &self.min_work_secs)
            .field("max_work_secs", &self.max_work_secs)
            .field("failure_rate", &self.failure_rate)
            .field("metrics_bind", &self.metrics_bind)
            .field("mesh", &self.mesh)
            .finish()
    }
}

impl SoldierConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("soldier name is required (SOLDIER_NAME)");
        }
        validate_identity(&self.name).context("invalid soldier name")?;
        validate_identity(&self.commander).context("invalid commander name")?;
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            bail!("concurrency must be within 1..={MAX_CONCURRENCY}");
        }
        if self.min_work_secs > self.max_work_secs {
            bail!(
                "min_work_secs ({}) exceeds max_work_secs ({})",
                self.min_work_secs,
                self.max_work_secs
            );
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            bail!("failure_rate must be within 0.0..=1.0");
        }
        Ok(())
    }

    pub fn commander_url(&self) -> String {
        self.commander_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:8080", self.commander))
    }

    pub fn profile(&self) -> ExecutionProfile {
        ExecutionProfile {
            min_work: Duration::from_secs(self.min_work_secs),
            max_work: Duration::from_secs(self.max_work_secs),
            failure_rate: self.failure_rate,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs.max(1))
    }

    pub fn broker_retry(&self) -> Duration {
        Duration::from_secs(self.broker_retry_secs.max(1))
    }
}
