//! Broker workload control
//!
//! The engine only emits [`Action`](crate::controllers::state::Action)s; the
//! dispatcher carries them out through a [`Workload`]. [`SnapWorkload`] drives
//! the broker snap on the host.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::controllers::resolver::SCRAM_MECHANISM;
use crate::error::{OperatorError, Result};
use crate::settings::OperatorSettings;

/// Operations the operator performs on the broker host
#[async_trait]
pub trait Workload: Send + Sync {
    async fn install(&self) -> Result<()>;

    /// Atomically replace `path` with `contents`.
    async fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    /// Disable then enable the service so it sees new mounts.
    async fn disable_enable(&self) -> Result<()>;

    async fn broker_active(&self) -> bool;

    async fn upsert_scram_user(
        &self,
        username: &str,
        password: &str,
        zookeeper: &str,
    ) -> Result<()>;

    async fn delete_scram_user(&self, username: &str, zookeeper: &str) -> Result<()>;
}

/// Broker packaged as a snap, controlled with the `snap` CLI
#[derive(Debug, Clone)]
pub struct SnapWorkload {
    snap: String,
    service: String,
    server_properties: PathBuf,
    kafka_opts: String,
    command_timeout: Duration,
}

impl SnapWorkload {
    pub fn new(settings: &OperatorSettings) -> Self {
        Self {
            snap: settings.snap_name.clone(),
            service: format!("{}.daemon", settings.snap_name),
            server_properties: settings.server_properties_path(),
            kafka_opts: format!(
                "-Djava.security.auth.login.config={}",
                settings.jaas_path().display()
            ),
            command_timeout: settings.command_timeout(),
        }
    }

    /// Run `command` to completion, killing it once the command timeout elapses.
    async fn output(&self, mut command: Command, label: &str) -> Result<Output> {
        command.kill_on_drop(true);
        match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(OperatorError::Workload(format!(
                "{} timed out after {}s",
                label,
                self.command_timeout.as_secs()
            ))),
        }
    }

    async fn snap(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "Running snap");
        let mut command = Command::new("snap");
        command.args(args);
        let output = self.output(command, &format!("snap {}", args.join(" "))).await?;
        if !output.status.success() {
            return Err(OperatorError::Workload(format!(
                "snap {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// Run one of the snap's bundled Kafka tools, e.g. `configs`.
    async fn bin(&self, tool: &str, args: &[String]) -> Result<String> {
        let program = format!("{}.{}", self.snap, tool);
        let tls_config = format!("--zk-tls-config-file={}", self.server_properties.display());
        let mut command = Command::new(&program);
        command.args(args).arg(&tls_config).env("KAFKA_OPTS", &self.kafka_opts);
        let output = self.output(command, &program).await?;
        if !output.status.success() {
            // args carry passwords; only the tool name is reported
            return Err(OperatorError::Workload(format!(
                "{} failed: {}",
                program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Workload for SnapWorkload {
    async fn install(&self) -> Result<()> {
        info!(snap = %self.snap, "Installing broker snap");
        self.snap(&["install", self.snap.as_str(), "--channel=latest/edge"]).await?;
        self.snap(&["connect", format!("{}:removable-media", self.snap).as_str()]).await?;
        Ok(())
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote workload file");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.snap(&["start", self.service.as_str()]).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.snap(&["stop", self.service.as_str()]).await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        self.snap(&["restart", self.service.as_str()]).await.map(|_| ())
    }

    async fn disable_enable(&self) -> Result<()> {
        self.snap(&["disable", self.snap.as_str()]).await?;
        self.snap(&["enable", self.snap.as_str()]).await?;
        Ok(())
    }

    async fn broker_active(&self) -> bool {
        match self.snap(&["services", self.service.as_str()]).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .skip(1)
                .any(|line| line.split_whitespace().nth(2) == Some("active")),
            Err(e) => {
                warn!(error = %e, "Could not query broker service");
                false
            }
        }
    }

    async fn upsert_scram_user(
        &self,
        username: &str,
        password: &str,
        zookeeper: &str,
    ) -> Result<()> {
        let args = vec![
            format!("--zookeeper={}", zookeeper),
            "--alter".to_string(),
            "--entity-type=users".to_string(),
            format!("--entity-name={}", username),
            format!("--add-config={}=[password={}]", SCRAM_MECHANISM, password),
        ];
        self.bin("configs", &args).await?;
        info!(username, "Upserted SCRAM user");
        Ok(())
    }

    async fn delete_scram_user(&self, username: &str, zookeeper: &str) -> Result<()> {
        let args = vec![
            format!("--zookeeper={}", zookeeper),
            "--alter".to_string(),
            "--entity-type=users".to_string(),
            format!("--entity-name={}", username),
            format!("--delete-config={}", SCRAM_MECHANISM),
        ];
        self.bin("configs", &args).await?;
        info!(username, "Deleted SCRAM user");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_names_follow_settings() {
        let workload = SnapWorkload::new(&OperatorSettings::default());
        assert_eq!(workload.service, "charmed-kafka.daemon");
        assert_eq!(
            workload.kafka_opts,
            "-Djava.security.auth.login.config=/var/snap/charmed-kafka/common/zookeeper-jaas.cfg"
        );
    }

    #[tokio::test]
    async fn test_hanging_command_times_out() {
        let workload = SnapWorkload {
            command_timeout: Duration::from_millis(100),
            ..SnapWorkload::new(&OperatorSettings::default())
        };
        let mut command = Command::new("sleep");
        command.arg("5");

        let started = std::time::Instant::now();
        let err = workload.output(command, "sleep 5").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(err, OperatorError::Workload(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_quick_command_completes() {
        let workload = SnapWorkload::new(&OperatorSettings::default());
        let mut command = Command::new("echo");
        command.arg("ready");
        let output = workload.output(command, "echo").await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ready");
    }

    #[tokio::test]
    async fn test_write_file_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("server.properties");
        let workload = SnapWorkload::new(&OperatorSettings::default());

        workload.write_file(&path, "a=1\n").await.unwrap();
        workload.write_file(&path, "a=2\n").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "a=2\n");
        assert!(!path.with_extension("tmp").exists());
    }
}
