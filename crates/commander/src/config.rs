use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use common::{validate_identity, MeshConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAME: &str = "commander1";
pub const DEFAULT_ROTATION_SECRET: &str = "super_secret";

/// Commander settings. Every field has a default, so a config file only
/// needs the keys it changes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommanderConfig {
    pub name: String,
    pub bind: SocketAddr,
    pub rotation_secret: String,
    pub broker_retry_secs: u64,
    pub mesh: MeshConfig,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            rotation_secret: DEFAULT_ROTATION_SECRET.to_string(),
            broker_retry_secs: 3,
            mesh: MeshConfig::default(),
        }
    }
}

impl std::fmt::Debug for CommanderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommanderConfig")
            .field("name", &self.name)
            .field("bind", &self.bind)
            .field("rotation_secret", &"<redacted>")
            .field("broker_retry_secs", &self.broker_retry_secs)
            .field("mesh", &self.mesh)
            .finish()
    }
}

impl CommanderConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_identity(&self.name).context("invalid commander name")?;
        if self.rotation_secret.is_empty() {
            anyhow::bail!("rotation secret must not be empty");
        }
        Ok(())
    }

    pub fn broker_retry(&self) -> Duration {
        Duration::from_secs(self.broker_retry_secs.max(1))
    }
}
