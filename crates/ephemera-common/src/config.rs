//! Engine configuration model.
//!
//! Loaded from a YAML file, then individual fields are overridden by the
//! CLI. Durations are written in humantime notation (`"2m"`, `"90s"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{EphemeraError, Result};

/// Inclusive range of external ports handed out to containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// Lowest port of the range.
    pub min: u16,
    /// Highest port of the range.
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: constants::DEFAULT_PORT_MIN,
            max: constants::DEFAULT_PORT_MAX,
        }
    }
}

/// Settings of the built-in discovery agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Image the discovery container runs.
    pub image: String,
    /// Upstream DNS server for names outside the environment.
    pub dns_recursor: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            image: constants::DEFAULT_DISCOVERY_IMAGE.into(),
            dns_recursor: constants::DEFAULT_DNS_RECURSOR.into(),
        }
    }
}

/// Root configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `*.tpl.rhai` scripts and their data directories.
    pub template_dir: PathBuf,
    /// Base directory for per-environment build workspaces.
    pub workspace_dir: PathBuf,
    /// Base directory for per-environment mounted files.
    pub mount_dir: PathBuf,
    /// External port range.
    pub ports: PortRange,
    /// Address clients use to reach exposed ports.
    pub export_address: String,
    /// Keepalive applied when a spec does not set one.
    #[serde(with = "humantime_duration")]
    pub default_keep_alive: Duration,
    /// Discovery agent settings.
    pub discovery: DiscoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join(constants::APP_NAME);
        Self {
            template_dir: PathBuf::from("templates"),
            workspace_dir: base.join("ws"),
            mount_dir: base.join("mounts"),
            ports: PortRange::default(),
            export_address: constants::DEFAULT_EXPORT_ADDRESS.into(),
            default_keep_alive: constants::DEFAULT_KEEP_ALIVE,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a configuration file, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails [`EngineConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EphemeraError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| EphemeraError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for an inverted port range, an empty
    /// directory or an empty export address.
    pub fn validate(&self) -> Result<()> {
        if self.ports.min > self.ports.max {
            return Err(EphemeraError::Config {
                message: format!(
                    "port range {}-{} is inverted",
                    self.ports.min, self.ports.max
                ),
            });
        }
        for (field, dir) in [
            ("template_dir", &self.template_dir),
            ("workspace_dir", &self.workspace_dir),
            ("mount_dir", &self.mount_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(EphemeraError::Config {
                    message: format!("{field} is empty"),
                });
            }
        }
        if self.export_address.trim().is_empty() {
            return Err(EphemeraError::Config {
                message: "export_address is empty".into(),
            });
        }
        Ok(())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}
