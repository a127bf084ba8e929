//! Inputs and outputs of one reconciliation step
//!
//! - [`Snapshot`]: what the runtime tells us about the world for this invocation
//! - [`Event`]: the trigger being handled
//! - [`UnitState`]: what this unit remembers between invocations
//! - [`Action`]: side effects for the dispatcher to carry out

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{UnitCondition, UnitStatus};
use crate::controllers::resolver::DesiredConfig;
use crate::controllers::rolling::{Need, OpId, OperationKind};
use crate::controllers::storage::StorageState;
use crate::model::config::CharmConfig;
use crate::model::relation::{BagOwner, RelationId, RelationSet};
use crate::model::storage::Volume;
use crate::model::unit::{PeerUnit, UnitHealth, UnitId};

/// World state handed over by the runtime for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub unit: UnitId,
    /// Leadership as decided by the runtime; `None` lets the operator decide
    #[serde(default)]
    pub leader: Option<bool>,
    #[serde(default)]
    pub config: CharmConfig,
    #[serde(default)]
    pub relations: RelationSet,
    /// Members of the peer cluster other than this unit
    #[serde(default)]
    pub peers: Vec<PeerUnit>,
    /// Whether the broker service is running
    #[serde(default)]
    pub broker_active: bool,
    pub now: DateTime<Utc>,
    /// Relations as the peers can see them. The dispatcher pins this at the
    /// start of an invocation; own writes made since are only in `relations`.
    #[serde(skip)]
    pub published: Option<RelationSet>,
}

impl Snapshot {
    /// All cluster members including this unit, sorted
    pub fn members(&self) -> Vec<UnitId> {
        let mut members: Vec<UnitId> = self.peers.iter().map(|p| p.id.clone()).collect();
        members.push(self.unit.clone());
        members.sort();
        members.dedup();
        members
    }

    pub fn published_relations(&self) -> &RelationSet {
        self.published.as_ref().unwrap_or(&self.relations)
    }

    /// Observed health per member; this unit is healthy by virtue of running
    pub fn health(&self) -> BTreeMap<UnitId, UnitHealth> {
        let mut health: BTreeMap<UnitId, UnitHealth> = self
            .peers
            .iter()
            .map(|p| (p.id.clone(), p.health))
            .collect();
        health.insert(self.unit.clone(), UnitHealth::Healthy);
        health
    }
}

/// Triggers handled by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Event {
    Install,
    Start,
    ConfigChanged,
    LeaderElected,
    UpgradeCharm,
    /// Periodic timer
    UpdateStatus,
    RelationJoined {
        relation_id: RelationId,
        #[serde(default)]
        unit: Option<UnitId>,
    },
    RelationChanged {
        relation_id: RelationId,
    },
    RelationDeparted {
        relation_id: RelationId,
        #[serde(default)]
        unit: Option<UnitId>,
    },
    RelationBroken {
        relation_id: RelationId,
    },
    StorageAttached {
        volume: Volume,
    },
    StorageDetaching {
        volume_id: String,
    },
    /// Operator action: rotate an internal user's password
    SetPassword {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    /// Operator action: restart this unit through the coordinator
    RollingRestartUnit,
    /// Operator action: read the admin credentials
    GetAdminCredentials,
    /// Internal: the local step of a rolling operation finished
    RollingStepFinished {
        owner: UnitId,
        op_id: OpId,
        succeeded: bool,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Install => "install",
            Event::Start => "start",
            Event::ConfigChanged => "config-changed",
            Event::LeaderElected => "leader-elected",
            Event::UpgradeCharm => "upgrade-charm",
            Event::UpdateStatus => "update-status",
            Event::RelationJoined { .. } => "relation-joined",
            Event::RelationChanged { .. } => "relation-changed",
            Event::RelationDeparted { .. } => "relation-departed",
            Event::RelationBroken { .. } => "relation-broken",
            Event::StorageAttached { .. } => "storage-attached",
            Event::StorageDetaching { .. } => "storage-detaching",
            Event::SetPassword { .. } => "set-password",
            Event::RollingRestartUnit => "rolling-restart-unit",
            Event::GetAdminCredentials => "get-admin-credentials",
            Event::RollingStepFinished { .. } => "rolling-step-finished",
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Event::SetPassword { .. } | Event::RollingRestartUnit | Event::GetAdminCredentials
        )
    }
}

/// Lifecycle phase of the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    WaitingForDependencies,
    Configuring,
    Starting,
    Active,
    Degraded,
}

/// Private state of one unit, persisted between invocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct UnitState {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub installed: bool,
    /// The broker service has been started and not stopped since
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub last_applied: Option<DesiredConfig>,
    /// Disruptive step not yet handed to the coordinator
    #[serde(default)]
    pub pending_restart: Option<Need>,
    #[serde(default)]
    pub storage: StorageState,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default)]
    pub conditions: Vec<UnitCondition>,
}

/// Side effects requested by the engine, applied in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Action {
    InstallWorkload,
    WriteFile {
        path: PathBuf,
        contents: String,
    },
    StartService,
    StopService,
    ExecuteRollingStep {
        owner: UnitId,
        op_id: OpId,
        kind: OperationKind,
    },
    UpsertScramUser {
        username: String,
        password: String,
        zookeeper: String,
    },
    DeleteScramUser {
        username: String,
        zookeeper: String,
    },
    SetRelationData {
        relation_id: RelationId,
        owner: BagOwner,
        key: String,
        value: Option<String>,
    },
    SetStatus {
        status: UnitStatus,
    },
    ActionResult {
        results: BTreeMap<String, String>,
    },
    ActionFailed {
        message: String,
    },
}

impl Action {
    /// Whether the action changes anything outside the engine's own state
    pub fn is_write(&self) -> bool {
        !matches!(self, Action::ActionResult { .. } | Action::ActionFailed { .. })
    }
}

/// Output of one reducer step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: UnitState,
    pub actions: Vec<Action>,
}

impl Transition {
    pub fn writes(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.is_write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event: Event = serde_json::from_str(
            r#"{"kind": "storage-attached", "volume": {"id": "log-data/1", "size": "20G"}}"#,
        )
        .unwrap();
        match &event {
            Event::StorageAttached { volume } => assert_eq!(volume.ordinal(), Some(1)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(event.name(), "storage-attached");

        let event: Event =
            serde_json::from_str(r#"{"kind": "relation-changed", "relation-id": 3}"#).unwrap();
        assert_eq!(event, Event::RelationChanged { relation_id: 3 });

        let raw = r#"{"kind": "set-password", "username": "admin"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.is_action());
    }

    #[test]
    fn test_snapshot_members_include_self() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{
                "unit": "kafka/1",
                "peers": [{"id": "kafka/2", "health": "unhealthy"}, {"id": "kafka/0"}],
                "now": "2024-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        let members: Vec<String> = snapshot.members().iter().map(|u| u.to_string()).collect();
        assert_eq!(members, vec!["kafka/0", "kafka/1", "kafka/2"]);
        let health = snapshot.health();
        assert_eq!(health[&UnitId::new("kafka", 1)], UnitHealth::Healthy);
        assert_eq!(health[&UnitId::new("kafka", 2)], UnitHealth::Unhealthy);
        assert_eq!(health[&UnitId::new("kafka", 0)], UnitHealth::Unknown);
        assert!(snapshot.leader.is_none());
    }

    #[test]
    fn test_action_wire_format() {
        let action = Action::SetRelationData {
            relation_id: 4,
            owner: BagOwner::App("kafka".into()),
            key: "chroot".into(),
            value: Some("/kafka".into()),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "set-relation-data");
        assert_eq!(json["relation-id"], 4);
        assert_eq!(json["owner"], "kafka");
    }
}
