//! Reconciliation Engine
//!
//! A pure reducer: given the unit's persisted [`UnitState`], the runtime's
//! [`Snapshot`] and one [`Event`], produce the next state plus the ordered
//! [`Action`]s that get the world there. Nothing here touches the workload
//! or the store; the dispatcher does that.
//!
//! Every event, whatever its kind, ends in the same reconciliation pass:
//!
//! 1. leader duties (internal credentials, client users, provider bags)
//! 2. resolve the desired broker configuration
//! 3. write files that differ from the last applied render
//! 4. classify the change and hand disruptive steps to the coordinator
//! 5. evaluate the rolling protocol and maybe execute the local step
//! 6. settle the status line and conditions
//!
//! Relation writes are only emitted for keys whose value actually changes,
//! so replaying an event against the state it produced yields no actions.

use std::collections::BTreeMap;
use std::iter;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::conditions::{
    record_condition, UnitStatus, UNIT_CONDITION_DEGRADED, UNIT_CONDITION_READY,
    UNIT_CONDITION_ROLLING, UNIT_CONDITION_STORAGE_READY,
};
use crate::controllers::observability;
use crate::controllers::provider;
use crate::controllers::render::{properties_text, render, restart_need, RestartNeed};
use crate::controllers::resolver::{DesiredConfig, Resolver, ResolverInput};
use crate::controllers::rolling::{
    read_record, Coordinator, Need, OperationKind, OperationScope, PeerView, RequestOutcome,
    StepOrder, ROLLING_KEY,
};
use crate::controllers::state::{Action, Event, Phase, Snapshot, Transition, UnitState};
use crate::controllers::storage::StorageChange;
use crate::error::{OperatorError, Result};
use crate::leader_election;
use crate::model::databags::{
    client_username, password_key, PeerAppData, PeerUnitData, ZookeeperData, ADMIN_USER,
    INTERNAL_USERS,
};
use crate::model::relation::{
    diff_bags, BagOwner, DataBag, Interface, Relation, RelationId, RelationSet,
};
use crate::model::unit::UnitId;
use crate::settings::OperatorSettings;

/// Units that never started acknowledge their turn inline; bounds that loop
const MAX_INLINE_ACKS: usize = 8;

const PASSWORD_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Source of generated passwords
pub trait SecretSource: Send {
    fn generate(&mut self) -> String;
}

/// Random alphanumeric passwords
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSecrets;

impl SecretSource for RandomSecrets {
    fn generate(&mut self) -> String {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        iter::repeat(())
            .map(|()| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .take(PASSWORD_LENGTH)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Per-event working set
// ---------------------------------------------------------------------------

enum Flow {
    Reconcile,
    Done,
}

struct Step<'a> {
    snapshot: &'a Snapshot,
    leader: bool,
    members: Vec<UnitId>,
    /// Relations with this step's own writes applied
    relations: RelationSet,
    state: UnitState,
    actions: Vec<Action>,
    /// Event-specific message shown over a healthy status
    notice: Option<UnitStatus>,
    status: Option<UnitStatus>,
    phase: Option<Phase>,
    executing: Option<StepOrder>,
    rolling: bool,
    degraded: Vec<UnitId>,
}

impl<'a> Step<'a> {
    fn me(&self) -> &'a UnitId {
        &self.snapshot.unit
    }

    fn relation_id(&self, interface: Interface) -> Option<RelationId> {
        self.relations.get(interface).map(|r| r.id)
    }

    fn set_key(
        &mut self,
        relation_id: RelationId,
        owner: BagOwner,
        key: &str,
        value: Option<String>,
    ) {
        let relation = match self.relations.by_id_mut(relation_id) {
            Some(relation) => relation,
            None => return,
        };
        let current = relation.bag(&owner).and_then(|bag| bag.get(key)).cloned();
        if current == value {
            return;
        }
        relation.set(owner.clone(), key, value.clone());
        self.actions.push(Action::SetRelationData {
            relation_id,
            owner,
            key: key.to_string(),
            value,
        });
    }

    /// Make `owner`'s bag equal to `desired`, key by key.
    fn publish_bag(&mut self, relation_id: RelationId, owner: BagOwner, desired: &DataBag) {
        let current = self
            .relations
            .by_id(relation_id)
            .and_then(|r| r.bag(&owner).cloned())
            .unwrap_or_default();
        for (key, value) in diff_bags(&current, desired) {
            self.set_key(relation_id, owner.clone(), &key, value);
        }
    }

    fn peer_app(&self, app: &str) -> Result<PeerAppData> {
        match self.relations.get(Interface::Cluster) {
            Some(cluster) => PeerAppData::from_bag(&cluster.app_bag(app)),
            None => Ok(PeerAppData::default()),
        }
    }

    fn zookeeper(&self) -> Option<ZookeeperData> {
        let relation = self.relations.get(Interface::Zookeeper)?;
        ZookeeperData::from_bag(&relation.remote_app_bag()).ok().flatten()
    }

    fn need(&mut self, need: Need) {
        let merged = match self.state.pending_restart.take() {
            None => need,
            Some(pending) => merge_need(pending, need),
        };
        self.state.pending_restart = Some(merged);
    }

    fn fail(&mut self, err: &OperatorError) {
        self.status = Some(UnitStatus::from_error(err));
        self.phase = Some(if err.is_retryable() {
            Phase::WaitingForDependencies
        } else {
            Phase::Configuring
        });
    }
}

fn merge_need(pending: Need, need: Need) -> Need {
    let kind = if pending.kind.covers(need.kind) {
        pending.kind
    } else {
        need.kind
    };
    let cluster_wide =
        pending.scope == OperationScope::Cluster || need.scope == OperationScope::Cluster;
    let scope = if cluster_wide {
        OperationScope::Cluster
    } else {
        OperationScope::Unit
    };
    let reason = if kind == pending.kind && scope == pending.scope {
        pending.reason
    } else {
        need.reason
    };
    Need { kind, scope, reason }
}

fn kind_label(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Restart => "restarting broker",
        OperationKind::StorageRestart => "restarting broker for storage change",
        OperationKind::RotateCredentials => "restarting broker for credential rotation",
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    resolver: Resolver,
    coordinator: Coordinator,
    secrets: Box<dyn SecretSource>,
}

impl Engine {
    /// Contradictory storage declarations in `settings` are `Fatal`.
    pub fn new(settings: OperatorSettings) -> Result<Self> {
        Self::with_secrets(settings, Box::new(RandomSecrets))
    }

    pub fn with_secrets(
        settings: OperatorSettings,
        secrets: Box<dyn SecretSource>,
    ) -> Result<Self> {
        let coordinator = Coordinator::new(settings.rolling_timeout());
        let resolver = Resolver::new(settings)?;
        Ok(Self {
            resolver,
            coordinator,
            secrets,
        })
    }

    pub fn settings(&self) -> &OperatorSettings {
        self.resolver.settings()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Handle one event.
    pub fn reduce(&mut self, state: &UnitState, snapshot: &Snapshot, event: &Event) -> Transition {
        let leadership = leader_election::elect(snapshot);
        let mut step = Step {
            snapshot,
            leader: leadership.is_leader,
            members: snapshot.members(),
            relations: snapshot.relations.clone(),
            state: state.clone(),
            actions: Vec::new(),
            notice: None,
            status: None,
            phase: None,
            executing: None,
            rolling: false,
            degraded: Vec::new(),
        };
        debug!(
            unit = %snapshot.unit,
            event = event.name(),
            leader = step.leader,
            "Reducing event"
        );

        if let Flow::Reconcile = self.handle_event(&mut step, event) {
            self.reconcile(&mut step, event);
        }

        let Step {
            mut state,
            mut actions,
            status,
            notice,
            ..
        } = step;
        let status = match (status, notice) {
            (Some(status), None) => status,
            (Some(status), Some(notice)) => overlay(status, notice),
            (None, Some(notice)) => notice,
            (None, None) => state.status.clone(),
        };
        if status != state.status {
            info!(unit = %snapshot.unit, status = ?status, "Unit status changed");
            actions.push(Action::SetStatus {
                status: status.clone(),
            });
            state.status = status;
        }
        Transition { state, actions }
    }

    // -----------------------------------------------------------------------
    // Event-specific handling
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, step: &mut Step<'_>, event: &Event) -> Flow {
        match event {
            Event::Install => {
                if !step.state.installed {
                    step.actions.push(Action::InstallWorkload);
                    step.state.installed = true;
                }
                Flow::Reconcile
            }
            Event::Start
            | Event::ConfigChanged
            | Event::LeaderElected
            | Event::UpgradeCharm
            | Event::UpdateStatus
            | Event::RelationJoined { .. }
            | Event::RelationChanged { .. }
            | Event::RelationDeparted { .. } => Flow::Reconcile,
            Event::RelationBroken { relation_id } => self.relation_broken(step, *relation_id),
            Event::StorageAttached { volume } => {
                match self
                    .resolver
                    .storage()
                    .attach(&mut step.state.storage, volume.clone())
                {
                    Ok(outcome) => {
                        if outcome.became_ready() {
                            info!(unit = %step.me(), volume = %volume.id, "Storage ready");
                        }
                        if outcome.change == StorageChange::Attached && step.state.started {
                            step.notice = Some(UnitStatus::Active(
                                "manual partition reassignment may be needed for Kafka to utilize new storage volumes"
                                    .to_string(),
                            ));
                        }
                    }
                    Err(e) => {
                        warn!(
                            unit = %step.me(),
                            volume = %volume.id,
                            error = %e,
                            "Storage attach rejected"
                        );
                        step.notice = Some(UnitStatus::from_error(&e));
                    }
                }
                Flow::Reconcile
            }
            Event::StorageDetaching { volume_id } => {
                let outcome = self
                    .resolver
                    .storage()
                    .detach(&mut step.state.storage, volume_id);
                if outcome.became_unready() {
                    warn!(unit = %step.me(), volume = %volume_id, "Storage no longer ready");
                }
                if outcome.change == StorageChange::Detached && step.state.started {
                    let message = if step.snapshot.peers.is_empty() {
                        "potential log-data loss due to storage removal without replication"
                    } else {
                        "manual partition reassignment from replicated brokers recommended due to lost partitions on removed storage volumes"
                    };
                    step.notice = Some(UnitStatus::Blocked(message.to_string()));
                }
                Flow::Reconcile
            }
            Event::SetPassword { username, password } => {
                self.set_password(step, username, password.as_deref())
            }
            Event::RollingRestartUnit => {
                step.need(Need {
                    kind: OperationKind::Restart,
                    scope: OperationScope::Unit,
                    reason: "rolling-restart-unit action".to_string(),
                });
                let mut results = BTreeMap::new();
                results.insert("status".to_string(), "queued".to_string());
                step.actions.push(Action::ActionResult { results });
                Flow::Reconcile
            }
            Event::GetAdminCredentials => {
                self.admin_credentials(step);
                Flow::Done
            }
            Event::RollingStepFinished {
                owner,
                op_id,
                succeeded,
            } => {
                let restart_id = match step.relation_id(Interface::Restart) {
                    Some(id) => id,
                    None => return Flow::Reconcile,
                };
                let view = self.peer_view(step, restart_id);
                let record = self
                    .coordinator
                    .finish_step(&view, owner, *op_id, step.snapshot.now);
                match record.encode() {
                    Ok(raw) => step.set_key(
                        restart_id,
                        BagOwner::Unit(step.me().clone()),
                        ROLLING_KEY,
                        Some(raw),
                    ),
                    Err(e) => {
                        step.fail(&e);
                        return Flow::Done;
                    }
                }
                if !succeeded {
                    warn!(unit = %step.me(), owner = %owner, op_id, "Rolling step failed");
                    step.notice = Some(UnitStatus::Blocked(format!(
                        "Broker {} failed to restart",
                        step.me().index()
                    )));
                }
                Flow::Reconcile
            }
        }
    }

    fn relation_broken(&mut self, step: &mut Step<'_>, relation_id: RelationId) -> Flow {
        let removed = match step.relations.remove(relation_id) {
            Some(relation) => relation,
            None => return Flow::Reconcile,
        };
        info!(unit = %step.me(), relation_id, interface = %removed.interface, "Relation broken");
        if removed.interface != Interface::Zookeeper {
            return Flow::Reconcile;
        }

        if step.state.started {
            step.actions.push(Action::StopService);
            step.state.started = false;
        }
        if step.leader {
            let app = self.settings().app_name.clone();
            if let Some(cluster_id) = step.relation_id(Interface::Cluster) {
                step.set_key(cluster_id, BagOwner::App(app), "broker-creds", None);
            }
        }
        step.status = Some(UnitStatus::Blocked(
            "missing required zookeeper relation".to_string(),
        ));
        step.phase = Some(Phase::WaitingForDependencies);
        step.state.phase = Phase::WaitingForDependencies;
        Flow::Done
    }

    fn set_password(
        &mut self,
        step: &mut Step<'_>,
        username: &str,
        password: Option<&str>,
    ) -> Flow {
        let fail = |step: &mut Step<'_>, message: String| {
            warn!(unit = %step.me(), username, reason = %message, "set-password failed");
            step.actions.push(Action::ActionFailed { message });
            Flow::Done
        };

        if !step.leader {
            return fail(step, "Password rotation must be called on leader unit".to_string());
        }
        if !INTERNAL_USERS.contains(&username) {
            return fail(
                step,
                format!(
                    "Can only update internal charm users: {}, not {}.",
                    INTERNAL_USERS.join(" or "),
                    username
                ),
            );
        }
        let app = self.settings().app_name.clone();
        let cluster = step.relation_id(Interface::Cluster);
        let (cluster_id, zookeeper) = match (cluster, step.zookeeper()) {
            (Some(id), Some(zk)) => (id, zk),
            _ => return fail(step, "Unable to update user.".to_string()),
        };
        let peer_app = match step.peer_app(&app) {
            Ok(data) => data,
            Err(_) => return fail(step, "Unable to update user.".to_string()),
        };

        let new_password = match password {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => self.secrets.generate(),
        };
        if peer_app.password(username) == Some(new_password.as_str()) {
            return fail(
                step,
                "Password already exists, please choose a different password.".to_string(),
            );
        }

        info!(unit = %step.me(), username, "Rotating internal user password");
        step.actions.push(Action::UpsertScramUser {
            username: username.to_string(),
            password: new_password.clone(),
            zookeeper: zookeeper.connect_string(),
        });
        step.set_key(
            cluster_id,
            BagOwner::App(app),
            &password_key(username),
            Some(new_password.clone()),
        );
        let mut results = BTreeMap::new();
        results.insert(password_key(username), new_password);
        step.actions.push(Action::ActionResult { results });
        step.need(Need {
            kind: OperationKind::RotateCredentials,
            scope: OperationScope::Cluster,
            reason: format!("password rotated for {}", username),
        });
        Flow::Reconcile
    }

    fn admin_credentials(&self, step: &mut Step<'_>) {
        let desired = match &step.state.last_applied {
            Some(desired) => desired,
            None => {
                step.actions.push(Action::ActionFailed {
                    message: "client.properties file not found on target unit.".to_string(),
                });
                return;
            }
        };
        let app = &self.settings().app_name;
        let password = step
            .peer_app(app)
            .ok()
            .and_then(|data| data.password(ADMIN_USER).map(str::to_string))
            .unwrap_or_default();
        let client: BTreeMap<String, String> = desired
            .client_properties
            .iter()
            .filter(|(key, _)| !DesiredConfig::is_tls_property(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut results = BTreeMap::new();
        results.insert("username".to_string(), ADMIN_USER.to_string());
        results.insert("password".to_string(), password);
        results.insert("client-properties".to_string(), properties_text(&client));
        step.actions.push(Action::ActionResult { results });
    }

    // -----------------------------------------------------------------------
    // Reconciliation pass
    // -----------------------------------------------------------------------

    fn reconcile(&mut self, step: &mut Step<'_>, event: &Event) {
        if step.leader {
            if let Err(e) = self.leader_duties(step) {
                warn!(unit = %step.me(), error = %e, "Leader duties failed");
                step.fail(&e);
            }
        }
        self.publish_unit_metrics(step);

        let resolved = self.resolver.resolve(&ResolverInput {
            unit: step.me(),
            config: &step.snapshot.config,
            relations: &step.relations,
            members: &step.members,
            storage: &step.state.storage,
        });
        let resolved = match resolved {
            Ok(desired) => Some(desired),
            Err(e) => {
                if e.is_retryable() {
                    debug!(unit = %step.me(), reason = %e, "Desired config not resolvable yet");
                } else {
                    warn!(unit = %step.me(), error = %e, "Desired config rejected");
                }
                if step.status.is_none() {
                    step.fail(&e);
                }
                None
            }
        };

        if let Some(desired) = &resolved {
            if let Err(e) = self.apply(step, desired) {
                warn!(unit = %step.me(), error = %e, "Applying desired config failed");
                step.fail(&e);
            }
        }

        if let Err(e) = self.coordinate(step) {
            warn!(unit = %step.me(), error = %e, "Rolling coordination failed");
            step.fail(&e);
        }

        self.settle(step, resolved.is_some(), matches!(event, Event::UpdateStatus));
    }

    fn leader_duties(&mut self, step: &mut Step<'_>) -> Result<()> {
        let app = self.settings().app_name.clone();
        let owner = BagOwner::App(app.clone());

        if let Some(zk_id) = step.relation_id(Interface::Zookeeper) {
            step.set_key(zk_id, owner.clone(), "chroot", Some(format!("/{}", app)));
        }

        let cluster_id = match step.relation_id(Interface::Cluster) {
            Some(id) => id,
            None => return Ok(()),
        };

        let peer_app = step.peer_app(&app)?;
        for user in INTERNAL_USERS {
            if peer_app.password(user).is_none() {
                info!(unit = %step.me(), user, "Generating internal user password");
                let password = self.secrets.generate();
                step.set_key(cluster_id, owner.clone(), &password_key(user), Some(password));
            }
        }

        let peer_app = step.peer_app(&app)?;
        if let Some(zookeeper) = step.zookeeper() {
            let connect = zookeeper.connect_string();
            if !peer_app.broker_creds_added {
                for user in INTERNAL_USERS {
                    if let Some(password) = peer_app.password(user) {
                        step.actions.push(Action::UpsertScramUser {
                            username: user.to_string(),
                            password: password.to_string(),
                            zookeeper: connect.clone(),
                        });
                    }
                }
                info!(unit = %step.me(), "Registered internal users");
                step.set_key(
                    cluster_id,
                    owner.clone(),
                    "broker-creds",
                    Some(PeerAppData::broker_creds_value().to_string()),
                );
            }

            let unprovisioned: Vec<RelationId> = provider::client_requests(&step.relations)
                .into_iter()
                .map(|(relation, _)| relation.id)
                .filter(|id| !peer_app.client_passwords.contains_key(id))
                .collect();
            for relation_id in unprovisioned {
                let username = client_username(relation_id);
                let password = self.secrets.generate();
                info!(
                    unit = %step.me(),
                    relation_id,
                    username = %username,
                    "Provisioning client user"
                );
                step.actions.push(Action::UpsertScramUser {
                    username: username.clone(),
                    password: password.clone(),
                    zookeeper: connect.clone(),
                });
                step.set_key(cluster_id, owner.clone(), &username, Some(password));
            }

            for relation_id in provider::stale_client_passwords(&peer_app, &step.relations) {
                let username = client_username(relation_id);
                info!(unit = %step.me(), relation_id, username = %username, "Removing client user");
                step.actions.push(Action::DeleteScramUser {
                    username: username.clone(),
                    zookeeper: connect.clone(),
                });
                step.set_key(cluster_id, owner.clone(), &username, None);
            }
        }

        let metrics = observability::metrics_app_bag(self.settings())?;
        let metrics_ids: Vec<RelationId> = step
            .relations
            .all(Interface::MetricsEndpoint)
            .map(|r| r.id)
            .collect();
        for id in metrics_ids {
            step.publish_bag(id, owner.clone(), &metrics);
        }

        let dashboards = observability::dashboard_app_bag(self.settings())?;
        let dashboard_ids: Vec<RelationId> = step
            .relations
            .all(Interface::GrafanaDashboard)
            .map(|r| r.id)
            .collect();
        for id in dashboard_ids {
            step.publish_bag(id, owner.clone(), &dashboards);
        }
        Ok(())
    }

    fn publish_unit_metrics(&self, step: &mut Step<'_>) {
        let address = step
            .relations
            .get(Interface::Cluster)
            .and_then(|cluster| PeerUnitData::from_bag(&cluster.unit_bag(step.me())).ok())
            .and_then(|data| data.private_address);
        let address = match address {
            Some(address) => address,
            None => return,
        };
        let bag = observability::metrics_unit_bag(step.me(), &address);
        let ids: Vec<RelationId> = step
            .relations
            .all(Interface::MetricsEndpoint)
            .map(|r| r.id)
            .collect();
        for id in ids {
            step.publish_bag(id, BagOwner::Unit(step.me().clone()), &bag);
        }
    }

    fn apply(&self, step: &mut Step<'_>, desired: &DesiredConfig) -> Result<()> {
        let settings = self.resolver.settings();
        let previous = step
            .state
            .last_applied
            .as_ref()
            .map(|old| render(old, settings))
            .unwrap_or_default();
        for file in render(desired, settings) {
            if !previous.contains(&file) {
                debug!(unit = %step.me(), path = %file.path.display(), "Writing workload file");
                step.actions.push(Action::WriteFile {
                    path: file.path,
                    contents: file.contents,
                });
            }
        }

        if step.state.started {
            match restart_need(step.state.last_applied.as_ref(), desired) {
                RestartNeed::None => {}
                RestartNeed::Restart => step.need(Need {
                    kind: OperationKind::Restart,
                    scope: OperationScope::Unit,
                    reason: "broker configuration changed".to_string(),
                }),
                RestartNeed::StorageRestart => step.need(Need {
                    kind: OperationKind::StorageRestart,
                    scope: OperationScope::Unit,
                    reason: "log directories changed".to_string(),
                }),
            }
        }
        step.state.last_applied = Some(desired.clone());

        let app = settings.app_name.clone();
        let peer_app = step.peer_app(&app)?;
        if step.leader {
            let port = provider::client_port(settings, desired);
            let endpoints = provider::broker_endpoints(&step.relations, &step.members, port)?;
            let mut bags = Vec::new();
            for (relation, _request) in provider::client_requests(&step.relations) {
                if let Some(password) = peer_app.client_passwords.get(&relation.id) {
                    let bag =
                        provider::connection_bag(relation, password, desired, endpoints.clone())?;
                    bags.push((relation.id, bag));
                }
            }
            for (id, bag) in bags {
                step.publish_bag(id, BagOwner::App(app.clone()), &bag);
            }
        }

        if !step.state.started {
            if !step.state.installed {
                step.status = Some(UnitStatus::Maintenance(
                    "waiting for workload install".to_string(),
                ));
                step.phase = Some(Phase::Starting);
            } else if peer_app.broker_creds_added {
                info!(unit = %step.me(), broker_id = desired.broker_id, "Starting broker");
                step.actions.push(Action::StartService);
                step.state.started = true;
            } else {
                step.status = Some(UnitStatus::Waiting(
                    "waiting for leader to register internal users".to_string(),
                ));
                step.phase = Some(Phase::Starting);
            }
        }
        Ok(())
    }

    fn peer_view(&self, step: &Step<'_>, restart_id: RelationId) -> PeerView {
        let mut view = match step.relations.by_id(restart_id) {
            Some(relation) => {
                PeerView::from_relation(step.me(), &step.members, step.snapshot.health(), relation)
            }
            None => PeerView::from_relation(
                step.me(),
                &step.members,
                step.snapshot.health(),
                &Relation::new(restart_id, Interface::Restart, self.settings().app_name.clone()),
            ),
        };
        view.published = step
            .snapshot
            .published_relations()
            .by_id(restart_id)
            .map(|relation| read_record(relation, step.me()))
            .unwrap_or_default();
        view
    }

    fn coordinate(&mut self, step: &mut Step<'_>) -> Result<()> {
        let restart_id = match step.relation_id(Interface::Restart) {
            Some(id) => id,
            None => return Ok(()),
        };
        let now = step.snapshot.now;
        let mut view = self.peer_view(step, restart_id);
        let original = view.own().clone();

        if let Some(need) = step.state.pending_restart.take() {
            let (record, outcome) = self.coordinator.request(&view, &need, now);
            view.set_own(record);
            match outcome {
                RequestOutcome::Posted(op_id) => {
                    info!(
                        unit = %step.me(),
                        op_id,
                        kind = ?need.kind,
                        "Requested rolling operation"
                    )
                }
                RequestOutcome::Joined { owner, op_id } => {
                    debug!(unit = %step.me(), owner = %owner, op_id, "Joined rolling operation")
                }
                RequestOutcome::Superseded { old_id, new_id } => {
                    info!(unit = %step.me(), old_id, new_id, "Superseded rolling operation")
                }
            }
        }

        let mut executing = None;
        for _ in 0..MAX_INLINE_ACKS {
            let tick = self.coordinator.tick(&view, now);
            view.set_own(tick.record.clone());
            if let Some(done) = &tick.completed {
                info!(
                    unit = %step.me(),
                    op_id = done.op_id,
                    status = ?done.status,
                    "Rolling operation finished"
                );
            }
            step.degraded = tick.degraded.clone();
            match tick.execute {
                Some(order) if step.state.started => {
                    executing = Some(order);
                    break;
                }
                Some(order) => {
                    debug!(
                        unit = %step.me(),
                        owner = %order.owner,
                        op_id = order.op_id,
                        "Broker not started, acknowledging step"
                    );
                    let record = self
                        .coordinator
                        .finish_step(&view, &order.owner, order.op_id, now);
                    view.set_own(record);
                }
                None => break,
            }
        }

        let own = view.own().clone();
        if own != original {
            step.set_key(
                restart_id,
                BagOwner::Unit(step.me().clone()),
                ROLLING_KEY,
                Some(own.encode()?),
            );
        }
        step.rolling = own.request.is_some() || executing.is_some();
        if let Some(order) = executing {
            step.actions.push(Action::ExecuteRollingStep {
                owner: order.owner.clone(),
                op_id: order.op_id,
                kind: order.kind,
            });
            step.executing = Some(order);
        }
        Ok(())
    }

    fn settle(&self, step: &mut Step<'_>, resolved: bool, periodic: bool) {
        let now = step.snapshot.now;
        let degraded = !step.degraded.is_empty();

        if step.status.is_none() {
            let (status, phase) = if let Some(order) = &step.executing {
                (UnitStatus::Maintenance(kind_label(order.kind).to_string()), Phase::Active)
            } else if periodic && step.state.started && !step.snapshot.broker_active {
                (
                    UnitStatus::Blocked("broker service is not running".to_string()),
                    Phase::Starting,
                )
            } else if degraded {
                let names: Vec<String> = step.degraded.iter().map(|u| u.to_string()).collect();
                let err = OperatorError::PeerTimeout(format!(
                    "{} excluded from rolling operation",
                    names.join(", ")
                ));
                (UnitStatus::from_error(&err), Phase::Degraded)
            } else {
                (UnitStatus::active(), Phase::Active)
            };
            step.status = Some(status);
            step.phase = Some(phase);
        }
        if let Some(phase) = step.phase {
            step.state.phase = phase;
        }

        let ready = resolved && step.state.started;
        let storage_ready = self.resolver.storage().is_ready(&step.state.storage);
        let observed = [
            (UNIT_CONDITION_READY, ready, "BrokerConfigured", "NotReady"),
            (UNIT_CONDITION_STORAGE_READY, storage_ready, "VolumesAttached", "VolumesMissing"),
            (UNIT_CONDITION_ROLLING, step.rolling, "InProgress", "Idle"),
            (UNIT_CONDITION_DEGRADED, degraded, "PeerTimeout", "AllPeersHealthy"),
        ];
        for (kind, holds, when_true, when_false) in observed {
            let reason = if holds { when_true } else { when_false };
            if record_condition(&mut step.state.conditions, kind, holds, reason, now) {
                debug!(unit = %step.me(), condition = kind, holds, "Condition changed");
            }
        }
    }
}

/// Event notices win over a healthy status; blocked notices win over
/// anything short of an error.
fn overlay(status: UnitStatus, notice: UnitStatus) -> UnitStatus {
    match (&status, &notice) {
        (UnitStatus::Error(_), _) => status,
        (_, UnitStatus::Blocked(_)) => notice,
        (UnitStatus::Active(m), _) if m.is_empty() => notice,
        _ => status,
    }
}
