//! Event dispatcher
//!
//! One invocation of the operator handles a batch of events for one unit:
//! load the unit's state from the [`Store`], run each event through the
//! [`Engine`], carry out the resulting actions against the [`Workload`], and
//! persist the new state with compare-and-set.
//!
//! Events are processed strictly one at a time from an explicit queue.
//! Follow-up events (the end of a rolling step) are appended to the queue,
//! never handled re-entrantly. Relation writes of an event are buffered and
//! only published once every action of that event succeeded, so a failed
//! event leaves neither relation data nor persisted state behind.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::conditions::UnitStatus;
use crate::controllers::engine::Engine;
use crate::controllers::rolling::OperationKind;
use crate::controllers::state::{Action, Event, Phase, Snapshot, UnitState};
use crate::error::Result;
use crate::model::relation::{BagOwner, RelationId};
use crate::model::unit::UnitId;
use crate::store::{self, Scope, Store};
use crate::workload::Workload;

/// Store key of the persisted [`UnitState`]
pub const STATE_KEY: &str = "state";

/// Input of one invocation: the world as the runtime sees it and the events
/// to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Bundle {
    pub snapshot: Snapshot,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A relation key published during the invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelationWrite {
    pub relation_id: RelationId,
    pub owner: BagOwner,
    pub key: String,
    pub value: Option<String>,
}

/// What the invocation did, printed for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InvocationReport {
    pub unit: UnitId,
    pub status: UnitStatus,
    pub phase: Phase,
    pub relation_writes: Vec<RelationWrite>,
    pub action_results: Vec<BTreeMap<String, String>>,
    pub action_failures: Vec<String>,
    pub events_processed: usize,
    /// Events left in the queue when the per-invocation bound was hit
    pub events_dropped: usize,
    /// Failure of the last event, if any; its effects were not kept
    pub error: Option<String>,
}

impl InvocationReport {
    fn new(unit: UnitId, state: &UnitState) -> Self {
        Self {
            unit,
            status: state.status.clone(),
            phase: state.phase,
            relation_writes: Vec::new(),
            action_results: Vec::new(),
            action_failures: Vec::new(),
            events_processed: 0,
            events_dropped: 0,
            error: None,
        }
    }
}

/// Per-event buffer of effects that only become visible on success
#[derive(Default)]
struct Effects {
    writes: Vec<RelationWrite>,
    results: Vec<BTreeMap<String, String>>,
    failures: Vec<String>,
    follow_ups: Vec<Event>,
}

pub struct Dispatcher<W: Workload> {
    engine: Engine,
    workload: W,
    store: Arc<dyn Store>,
    queue_bound: usize,
}

impl<W: Workload> Dispatcher<W> {
    pub fn new(engine: Engine, workload: W, store: Arc<dyn Store>) -> Self {
        let queue_bound = engine.settings().queue_bound;
        Self {
            engine,
            workload,
            store,
            queue_bound,
        }
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Persisted state of `unit`, default when never persisted
    pub fn state(&self, unit: &UnitId) -> Result<UnitState> {
        Ok(self.load(unit)?.map(|(state, _)| state).unwrap_or_default())
    }

    fn load(&self, unit: &UnitId) -> Result<Option<(UnitState, u64)>> {
        store::load(self.store.as_ref(), &Scope::Unit(unit.clone()), STATE_KEY)
    }

    /// Handle `events` in order, then any follow-ups they produce.
    pub async fn dispatch(&mut self, bundle: Bundle) -> Result<InvocationReport> {
        let Bundle { mut snapshot, events } = bundle;
        snapshot.published = Some(snapshot.relations.clone());
        let unit = snapshot.unit.clone();
        let scope = Scope::Unit(unit.clone());
        let (mut state, mut version) = self.load(&unit)?.unwrap_or_default();
        let mut report = InvocationReport::new(unit.clone(), &state);
        let mut queue: VecDeque<Event> = events.into();

        while let Some(event) = queue.pop_front() {
            if report.events_processed >= self.queue_bound {
                report.events_dropped = queue.len() + 1;
                warn!(unit = %unit, dropped = report.events_dropped, "Event queue bound reached");
                break;
            }
            report.events_processed += 1;

            snapshot.broker_active = self.workload.broker_active().await;
            let transition = self.engine.reduce(&state, &snapshot, &event);
            debug!(
                unit = %unit,
                event = event.name(),
                actions = transition.actions.len(),
                "Applying transition"
            );

            let effects = match self.apply(&transition.actions).await {
                Ok(effects) => effects,
                Err(e) => {
                    error!(unit = %unit, event = event.name(), error = %e, "Event failed");
                    if event.is_action() {
                        report.action_failures.push(e.to_string());
                    }
                    report.status = UnitStatus::Error(format!("{} failed: {}", event.name(), e));
                    report.error = Some(e.to_string());
                    return Ok(report);
                }
            };

            for write in &effects.writes {
                if let Some(relation) = snapshot.relations.by_id_mut(write.relation_id) {
                    relation.set(write.owner.clone(), &write.key, write.value.clone());
                }
                let bag = Scope::RelationBag {
                    relation_id: write.relation_id,
                    owner: write.owner.clone(),
                };
                match &write.value {
                    Some(value) => {
                        self.store
                            .put(&bag, &write.key, serde_json::Value::String(value.clone()), None)?;
                    }
                    None => self.store.delete(&bag, &write.key)?,
                }
            }

            if transition.state != state {
                version = store::save(
                    self.store.as_ref(),
                    &scope,
                    STATE_KEY,
                    &transition.state,
                    Some(version),
                )?;
                state = transition.state;
            }

            report.relation_writes.extend(effects.writes);
            report.action_results.extend(effects.results);
            report.action_failures.extend(effects.failures);
            queue.extend(effects.follow_ups);
            info!(unit = %unit, event = event.name(), phase = ?state.phase, "Processed event");
        }

        report.status = state.status.clone();
        report.phase = state.phase;
        Ok(report)
    }

    async fn apply(&self, actions: &[Action]) -> Result<Effects> {
        let mut effects = Effects::default();
        for action in actions {
            match action {
                Action::InstallWorkload => self.workload.install().await?,
                Action::WriteFile { path, contents } => {
                    self.workload.write_file(path, contents).await?
                }
                Action::StartService => self.workload.start().await?,
                Action::StopService => self.workload.stop().await?,
                Action::ExecuteRollingStep {
                    owner,
                    op_id,
                    kind,
                } => {
                    let outcome = match kind {
                        OperationKind::StorageRestart => self.workload.disable_enable().await,
                        OperationKind::Restart | OperationKind::RotateCredentials => {
                            self.workload.restart().await
                        }
                    };
                    if let Err(e) = &outcome {
                        warn!(owner = %owner, op_id, error = %e, "Rolling step failed");
                    }
                    effects.follow_ups.push(Event::RollingStepFinished {
                        owner: owner.clone(),
                        op_id: *op_id,
                        succeeded: outcome.is_ok(),
                    });
                }
                Action::UpsertScramUser {
                    username,
                    password,
                    zookeeper,
                } => {
                    self.workload
                        .upsert_scram_user(username, password, zookeeper)
                        .await?
                }
                Action::DeleteScramUser {
                    username,
                    zookeeper,
                } => self.workload.delete_scram_user(username, zookeeper).await?,
                Action::SetRelationData {
                    relation_id,
                    owner,
                    key,
                    value,
                } => effects.writes.push(RelationWrite {
                    relation_id: *relation_id,
                    owner: owner.clone(),
                    key: key.clone(),
                    value: value.clone(),
                }),
                Action::SetStatus { .. } => {}
                Action::ActionResult { results } => effects.results.push(results.clone()),
                Action::ActionFailed { message } => effects.failures.push(message.clone()),
            }
        }
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::OperatorSettings;
    use crate::store::MemoryStore;
    use crate::testing::{fixtures, RecordingWorkload, SequentialSecrets, WorkloadCall};

    fn dispatcher(store: &MemoryStore) -> Dispatcher<RecordingWorkload> {
        let engine = Engine::with_secrets(
            OperatorSettings::default(),
            Box::new(SequentialSecrets::default()),
        )
        .unwrap();
        Dispatcher::new(engine, RecordingWorkload::new(), Arc::new(store.clone()))
    }

    fn bundle(events: Vec<Event>) -> Bundle {
        Bundle {
            snapshot: fixtures::snapshot(0, 1, false),
            events,
        }
    }

    #[tokio::test]
    async fn test_install_then_storage_starts_broker() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store);
        let report = d
            .dispatch(bundle(vec![
                Event::Install,
                Event::StorageAttached {
                    volume: fixtures::ready_storage().volumes[0].clone(),
                },
            ]))
            .await
            .unwrap();

        assert_eq!(report.events_processed, 2);
        assert!(report.error.is_none());
        assert_eq!(report.status, UnitStatus::active());
        let calls = d.workload().calls();
        assert_eq!(calls[0], WorkloadCall::Install);
        assert!(calls.contains(&WorkloadCall::Start));
        let state = d.state(&fixtures::unit(0)).unwrap();
        assert!(state.started);
        assert!(state.last_applied.is_some());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store);
        d.dispatch(bundle(vec![Event::Install])).await.unwrap();
        let before = d.state(&fixtures::unit(0)).unwrap();

        let settings = OperatorSettings::default();
        d.workload()
            .fail_next(WorkloadCall::WriteFile(settings.server_properties_path()));
        let report = d
            .dispatch(bundle(vec![Event::StorageAttached {
                volume: fixtures::ready_storage().volumes[0].clone(),
            }]))
            .await
            .unwrap();

        assert!(matches!(report.status, UnitStatus::Error(_)));
        assert!(report.error.is_some());
        assert!(report.relation_writes.is_empty());
        assert_eq!(d.state(&fixtures::unit(0)).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_action_is_reported() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store);
        d.dispatch(bundle(vec![
            Event::Install,
            Event::StorageAttached {
                volume: fixtures::ready_storage().volumes[0].clone(),
            },
        ]))
        .await
        .unwrap();

        d.workload().fail_next(WorkloadCall::UpsertUser("admin".into()));
        let report = d
            .dispatch(bundle(vec![Event::SetPassword {
                username: "admin".into(),
                password: Some("fresh".into()),
            }]))
            .await
            .unwrap();

        assert!(report.action_results.is_empty());
        assert_eq!(report.action_failures.len(), 1);
        assert!(report.action_failures[0].contains("scripted failure"));
        assert!(report.relation_writes.is_empty());
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store);
        let events = vec![Event::UpdateStatus; 20];
        let report = d.dispatch(bundle(events)).await.unwrap();
        assert_eq!(report.events_processed, 16);
        assert_eq!(report.events_dropped, 4);
    }

    #[tokio::test]
    async fn test_rolling_restart_action_runs_step_and_finishes() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store);
        d.dispatch(bundle(vec![
            Event::Install,
            Event::StorageAttached {
                volume: fixtures::ready_storage().volumes[0].clone(),
            },
        ]))
        .await
        .unwrap();
        d.workload().clear();

        let mut b = bundle(vec![Event::RollingRestartUnit]);
        // carry over what the unit published in the first invocation
        b.snapshot.relations = fixtures::relations(1, false);
        let report = d.dispatch(b).await.unwrap();
        assert_eq!(report.action_results.len(), 1);
        assert!(!d.workload().calls().contains(&WorkloadCall::Restart));

        // the step runs once the request is visible to peers
        let mut relations = fixtures::relations(1, false);
        for write in &report.relation_writes {
            if let Some(relation) = relations.by_id_mut(write.relation_id) {
                relation.set(write.owner.clone(), &write.key, write.value.clone());
            }
        }
        let mut b = bundle(vec![Event::UpdateStatus]);
        b.snapshot.relations = relations;
        let report = d.dispatch(b).await.unwrap();

        assert!(d.workload().calls().contains(&WorkloadCall::Restart));
        assert_eq!(report.events_processed, 2);
        let state = d.state(&fixtures::unit(0)).unwrap();
        assert!(state.pending_restart.is_none());
        assert_eq!(report.status, UnitStatus::active());
    }
}
