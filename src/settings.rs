//! Operator settings
//!
//! Deployment-level knobs that are not user-facing charm config: where the
//! snap keeps its files, which ports the listeners use, how long the rolling
//! coordinator waits for a peer. Loaded from an optional TOML file; every key
//! has a default.

use std::path::{Path, PathBuf};

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OperatorError, Result};
use crate::model::storage::StorageSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OperatorSettings {
    /// Application name, also the ZooKeeper chroot
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_snap_name")]
    pub snap_name: String,

    /// Directory holding server.properties, client.properties and the JAAS file
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Mount root of the `log-data` volumes
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// State file used by the file-backed store
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default = "default_ports")]
    pub ports: Ports,

    /// Seconds a peer may take to start or finish its rolling step
    #[serde(default = "default_rolling_timeout_secs")]
    pub rolling_timeout_secs: u64,

    /// Maximum number of events processed in one invocation
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,

    /// Seconds a `snap` or Kafka tool invocation may run before it is killed
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Ports {
    pub client: u16,
    pub client_tls: u16,
    pub internal: u16,
    pub internal_tls: u16,
    pub node_exporter: u16,
    pub jmx_exporter: u16,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            snap_name: default_snap_name(),
            config_dir: default_config_dir(),
            storage_root: default_storage_root(),
            state_path: default_state_path(),
            ports: default_ports(),
            rolling_timeout_secs: default_rolling_timeout_secs(),
            queue_bound: default_queue_bound(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl OperatorSettings {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    OperatorError::Settings(format!("cannot read {}: {}", path.display(), e))
                })?;
                let settings: Self = toml::from_str(&raw)?;
                info!(path = %path.display(), "Loaded operator settings");
                settings
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() || self.app_name.contains('/') {
            return Err(OperatorError::Settings(format!(
                "app-name '{}' is not a valid application name",
                self.app_name
            )));
        }
        if self.rolling_timeout_secs == 0 {
            return Err(OperatorError::Settings(
                "rolling-timeout-secs must be positive".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(OperatorError::Settings(
                "command-timeout-secs must be positive".to_string(),
            ));
        }
        if self.queue_bound == 0 {
            return Err(OperatorError::Settings(
                "queue-bound must be positive".to_string(),
            ));
        }
        let p = self.ports;
        let mut all = [
            p.client,
            p.client_tls,
            p.internal,
            p.internal_tls,
            p.node_exporter,
            p.jmx_exporter,
        ];
        all.sort_unstable();
        if all.windows(2).any(|w| w[0] == w[1]) {
            return Err(OperatorError::Settings("ports must be distinct".to_string()));
        }
        Ok(())
    }

    pub fn rolling_timeout(&self) -> Duration {
        Duration::seconds(self.rolling_timeout_secs as i64)
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }

    pub fn storage_spec(&self) -> StorageSpec {
        StorageSpec::log_data(self.storage_root.clone())
    }

    pub fn server_properties_path(&self) -> PathBuf {
        self.config_dir.join("server.properties")
    }

    pub fn client_properties_path(&self) -> PathBuf {
        self.config_dir.join("client.properties")
    }

    pub fn jaas_path(&self) -> PathBuf {
        self.config_dir.join("zookeeper-jaas.cfg")
    }

    /// File the service reads `KAFKA_OPTS` from
    pub fn environment_path(&self) -> PathBuf {
        self.config_dir.join("kafka.env")
    }

    pub fn truststore_path(&self) -> PathBuf {
        self.config_dir.join("truststore.pem")
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.config_dir.join("keystore.pem")
    }
}

// Default value functions
fn default_app_name() -> String {
    "kafka".to_string()
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_snap_name() -> String {
    "charmed-kafka".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/var/snap/charmed-kafka/common")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/snap/charmed-kafka/common/var/lib/kafka")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/kafka-operator/state.json")
}

fn default_ports() -> Ports {
    Ports {
        client: 9092,
        client_tls: 9093,
        internal: 19092,
        internal_tls: 19093,
        node_exporter: 9100,
        jmx_exporter: 9101,
    }
}

fn default_rolling_timeout_secs() -> u64 {
    600
}

fn default_queue_bound() -> usize {
    16
}
