//! Storage Lifecycle Manager
//!
//! Tracks the `log-data` volumes attached to this unit. Attach requests are
//! validated against the declared minimum size and cardinality before they
//! are recorded; readiness flips when the first qualifying volume arrives
//! and when the last one leaves.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OperatorError, Result};
use crate::model::storage::{StorageSpec, Volume};

/// Volumes recorded for this unit, persisted with the unit state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct StorageState {
    /// Sorted by id
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl StorageState {
    pub fn contains(&self, volume_id: &str) -> bool {
        self.volumes.iter().any(|v| v.id == volume_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageChange {
    Unchanged,
    Attached,
    Detached,
}

/// Result of applying one attach or detach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOutcome {
    pub change: StorageChange,
    pub was_ready: bool,
    pub is_ready: bool,
}

impl StorageOutcome {
    pub fn became_ready(&self) -> bool {
        !self.was_ready && self.is_ready
    }

    pub fn became_unready(&self) -> bool {
        self.was_ready && !self.is_ready
    }
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    spec: StorageSpec,
}

impl StorageManager {
    /// Contradictory declarations are `Fatal`.
    pub fn new(spec: StorageSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self { spec })
    }

    pub fn is_ready(&self, state: &StorageState) -> bool {
        state.volumes.len() >= self.spec.min_count as usize
    }

    /// Ok when enough qualifying volumes are attached.
    pub fn readiness(&self, state: &StorageState) -> Result<()> {
        if self.is_ready(state) {
            Ok(())
        } else {
            Err(OperatorError::InvalidConfig(format!(
                "Storage volumes lower than minimum of {}",
                self.spec.min_count
            )))
        }
    }

    /// Record an attached volume. Rejected volumes are not recorded.
    pub fn attach(&self, state: &mut StorageState, volume: Volume) -> Result<StorageOutcome> {
        let was_ready = self.is_ready(state);
        if state.contains(&volume.id) {
            debug!(volume = %volume.id, "Volume already recorded");
            return Ok(StorageOutcome {
                change: StorageChange::Unchanged,
                was_ready,
                is_ready: was_ready,
            });
        }

        if volume.size < self.spec.minimum_size {
            warn!(volume = %volume.id, size = %volume.size, "Rejecting undersized volume");
            return Err(OperatorError::InvalidConfig(format!(
                "{} volume {} of size {} is below the minimum of {}",
                self.spec.name, volume.id, volume.size, self.spec.minimum_size
            )));
        }

        if let Some(max) = self.spec.max_count {
            if state.volumes.len() >= max as usize {
                return Err(OperatorError::InvalidConfig(format!(
                    "{} allows at most {} volume(s), cannot attach {}",
                    self.spec.name, max, volume.id
                )));
            }
        }

        info!(volume = %volume.id, size = %volume.size, "Attached storage volume");
        state.volumes.push(volume);
        state.volumes.sort_by(|a, b| a.ordinal().cmp(&b.ordinal()).then_with(|| a.id.cmp(&b.id)));

        Ok(StorageOutcome {
            change: StorageChange::Attached,
            was_ready,
            is_ready: self.is_ready(state),
        })
    }

    /// Forget a detaching volume. Unknown ids are a no-op.
    pub fn detach(&self, state: &mut StorageState, volume_id: &str) -> StorageOutcome {
        let was_ready = self.is_ready(state);
        let before = state.volumes.len();
        state.volumes.retain(|v| v.id != volume_id);
        let change = if state.volumes.len() == before {
            StorageChange::Unchanged
        } else {
            info!(volume = %volume_id, "Detached storage volume");
            StorageChange::Detached
        };
        StorageOutcome {
            change,
            was_ready,
            is_ready: self.is_ready(state),
        }
    }

    /// Mount paths of the recorded volumes, sorted
    pub fn mount_paths(&self, state: &StorageState) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = state
            .volumes
            .iter()
            .map(|v| v.mount_path(&self.spec.location))
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}
