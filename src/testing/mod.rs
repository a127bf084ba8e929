//! Test doubles and fixtures shared by unit and integration tests

pub mod fixtures;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::controllers::engine::SecretSource;
use crate::error::{OperatorError, Result};
use crate::model::relation::DataBag;
use crate::workload::Workload;

/// Deterministic passwords: `secret-1`, `secret-2`, ...
#[derive(Debug, Clone, Default)]
pub struct SequentialSecrets {
    issued: u32,
}

impl SecretSource for SequentialSecrets {
    fn generate(&mut self) -> String {
        self.issued += 1;
        format!("secret-{}", self.issued)
    }
}

/// One call made against a [`RecordingWorkload`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadCall {
    Install,
    WriteFile(PathBuf),
    Start,
    Stop,
    Restart,
    DisableEnable,
    UpsertUser(String),
    DeleteUser(String),
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Vec<WorkloadCall>,
    files: Vec<(PathBuf, String)>,
    /// Scripted failures, consumed in order by the matching call
    failures: VecDeque<WorkloadCall>,
}

/// In-memory workload that records every call; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingWorkload {
    recorder: Arc<Mutex<Recorder>>,
    active: Arc<AtomicBool>,
}

impl RecordingWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WorkloadCall> {
        self.lock().calls.clone()
    }

    pub fn clear(&self) {
        self.lock().calls.clear();
    }

    /// Latest contents written to `path`
    pub fn file(&self, path: &Path) -> Option<String> {
        self.lock()
            .files
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.clone())
    }

    /// Make the next call equal to `call` fail.
    pub fn fail_next(&self, call: WorkloadCall) {
        self.lock().failures.push_back(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorder> {
        match self.recorder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: WorkloadCall) -> Result<()> {
        let mut recorder = self.lock();
        if let Some(pos) = recorder.failures.iter().position(|f| *f == call) {
            recorder.failures.remove(pos);
            return Err(OperatorError::Workload(format!("scripted failure: {:?}", call)));
        }
        recorder.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl Workload for RecordingWorkload {
    async fn install(&self) -> Result<()> {
        self.record(WorkloadCall::Install)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.record(WorkloadCall::WriteFile(path.to_path_buf()))?;
        self.lock()
            .files
            .push((path.to_path_buf(), contents.to_string()));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.record(WorkloadCall::Start)?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record(WorkloadCall::Stop)?;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.record(WorkloadCall::Restart)?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_enable(&self) -> Result<()> {
        self.record(WorkloadCall::DisableEnable)?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn broker_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn upsert_scram_user(
        &self,
        username: &str,
        _password: &str,
        _zookeeper: &str,
    ) -> Result<()> {
        self.record(WorkloadCall::UpsertUser(username.to_string()))
    }

    async fn delete_scram_user(&self, username: &str, _zookeeper: &str) -> Result<()> {
        self.record(WorkloadCall::DeleteUser(username.to_string()))
    }
}

const TEST_PEM_BODY: &str = "aGVsbG8gd29ybGQ=";

fn pem_block(label: &str) -> String {
    format!(
        "-----BEGIN {label}-----\n{body}\n-----END {label}-----\n",
        label = label,
        body = TEST_PEM_BODY
    )
}

/// A `certificates` bag with well-formed PEM framing
pub fn pem_material() -> DataBag {
    let mut bag = DataBag::new();
    bag.insert("certificate".to_string(), pem_block("CERTIFICATE"));
    bag.insert("ca".to_string(), pem_block("CERTIFICATE"));
    bag.insert("private-key".to_string(), pem_block("PRIVATE KEY"));
    bag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_workload_scripted_failure() {
        let workload = RecordingWorkload::new();
        workload.fail_next(WorkloadCall::Restart);
        assert!(workload.restart().await.is_err());
        assert!(workload.restart().await.is_ok());
        assert!(workload.broker_active().await);
        assert_eq!(workload.calls(), vec![WorkloadCall::Restart]);
    }

    #[test]
    fn test_sequential_secrets() {
        let mut secrets = SequentialSecrets::default();
        assert_eq!(secrets.generate(), "secret-1");
        assert_eq!(secrets.generate(), "secret-2");
    }
}
