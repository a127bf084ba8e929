//! Rolling Operation Coordinator
//!
//! Serializes disruptive operations (restart, storage restart, credential
//! rotation) so that at most one unit of the cluster is mid-step at any
//! instant. Units never talk to each other directly: each one writes a
//! [`RollingRecord`] into its own unit bag of the `restart` peer relation and
//! reads everyone else's on its next event.
//!
//! Protocol, per operation `(id, owner)`:
//!
//! 1. The owner posts a request with `id = max(id seen anywhere, own sequence) + 1`.
//! 2. The active operation is the lowest `(id, owner)` request that still has
//!    unacknowledged participants.
//! 3. A participant executes only when nobody is mid-step and it is the
//!    smallest participant that has not acknowledged yet. It marks its step
//!    `running` before executing and `done` afterwards.
//! 4. The owner completes the operation once every participant is done,
//!    excluding unhealthy participants that did not start or finish within
//!    the timeout of their turn.
//!
//! Invocations of different units overlap, and a unit's writes only reach
//! its peers once its invocation returns. A unit therefore never executes in
//! the invocation that posted, reposted or withdrew its own request: it waits
//! until the request is published and the id tie-break has been evaluated
//! against everyone else's. Units looking at the same published bags agree
//! on the active operation and its next participant, so at most one of them
//! executes.
//!
//! Requests with the same id are resolved in favour of the smaller unit; the
//! loser withdraws or reposts, and either way leaves a supersession entry in
//! its bag.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::OperatorError;
use crate::model::relation::Relation;
use crate::model::unit::{UnitHealth, UnitId};

/// Unit bag key holding the serialized record
pub const ROLLING_KEY: &str = "rolling-op";

const MAX_SUPERSESSIONS: usize = 8;

pub type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Restart,
    /// Disable and re-enable the service
    StorageRestart,
    RotateCredentials,
}

impl OperationKind {
    /// Whether executing `self` also satisfies a need for `need`
    pub fn covers(&self, need: OperationKind) -> bool {
        match self {
            OperationKind::StorageRestart => true,
            OperationKind::Restart | OperationKind::RotateCredentials => {
                need != OperationKind::StorageRestart
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum OperationScope {
    /// Every live peer takes a turn
    Cluster,
    /// Only the requesting unit
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct OperationRequest {
    pub id: OpId,
    pub kind: OperationKind,
    pub scope: OperationScope,
    pub requested_at: DateTime<Utc>,
    pub reason: String,
    /// When the owner first saw this operation hold the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Running,
    Done,
}

/// One unit's progress on one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct StepRecord {
    pub op_id: OpId,
    pub owner: UnitId,
    pub state: StepState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CompletionStatus {
    Completed,
    CompletedDegraded { excluded: Vec<UnitId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct CompletionRecord {
    pub op_id: OpId,
    pub kind: OperationKind,
    #[serde(flatten)]
    pub status: CompletionStatus,
    pub at: DateTime<Utc>,
}

/// Explicit trace of a request that was replaced or withdrawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct SupersessionRecord {
    pub old_id: OpId,
    /// `None` when the request was withdrawn in favour of another unit's
    pub new_id: Option<OpId>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Another unit's operation this unit relies on instead of its own request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct JoinedOp {
    pub owner: UnitId,
    pub op_id: OpId,
    pub kind: OperationKind,
}

/// Everything one unit publishes under [`ROLLING_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct RollingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<OperationRequest>,
    /// Participants of the own request dropped after a timeout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<UnitId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined: Option<JoinedOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<CompletionRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersessions: Vec<SupersessionRecord>,
    #[serde(default)]
    pub sequence: OpId,
}

impl RollingRecord {
    pub fn decode(raw: &str) -> Result<Self, OperatorError> {
        serde_json::from_str(raw)
            .map_err(|e| OperatorError::InvalidConfig(format!("malformed rolling record: {}", e)))
    }

    pub fn encode(&self) -> Result<String, OperatorError> {
        Ok(serde_json::to_string(self)?)
    }

    fn step(&self, owner: &UnitId, op_id: OpId) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| &s.owner == owner && s.op_id == op_id)
    }

    fn supersede(&mut self, entry: SupersessionRecord) {
        self.supersessions.push(entry);
        if self.supersessions.len() > MAX_SUPERSESSIONS {
            let overflow = self.supersessions.len() - MAX_SUPERSESSIONS;
            self.supersessions.drain(..overflow);
        }
    }
}

/// A disruptive action the engine wants performed on this unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Need {
    pub kind: OperationKind,
    pub scope: OperationScope,
    pub reason: String,
}

/// Instruction to run the local step of an operation now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOrder {
    pub owner: UnitId,
    pub op_id: OpId,
    pub kind: OperationKind,
}

/// What this unit sees of the `restart` relation
#[derive(Debug, Clone)]
pub struct PeerView {
    pub me: UnitId,
    /// Live peers including this unit, sorted
    pub members: Vec<UnitId>,
    pub health: BTreeMap<UnitId, UnitHealth>,
    pub records: BTreeMap<UnitId, RollingRecord>,
    /// This unit's record as the peers currently see it
    pub published: RollingRecord,
}

/// Read `unit`'s record from the relation. Unreadable records are treated
/// as empty.
pub fn read_record(relation: &Relation, unit: &UnitId) -> RollingRecord {
    match relation.unit_bag(unit).get(ROLLING_KEY) {
        Some(raw) => match RollingRecord::decode(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(unit = %unit, error = %e, "Ignoring unreadable rolling record");
                RollingRecord::default()
            }
        },
        None => RollingRecord::default(),
    }
}

impl PeerView {
    /// Build the view from the relation's unit bags, taking the own record
    /// as already published.
    pub fn from_relation(
        me: &UnitId,
        members: &[UnitId],
        health: BTreeMap<UnitId, UnitHealth>,
        relation: &Relation,
    ) -> Self {
        let mut records = BTreeMap::new();
        for unit in members {
            records.insert(unit.clone(), read_record(relation, unit));
        }
        let mut members = members.to_vec();
        if !members.contains(me) {
            members.push(me.clone());
            records.entry(me.clone()).or_default();
        }
        members.sort();
        members.dedup();
        let published = records.get(me).cloned().unwrap_or_default();
        Self {
            me: me.clone(),
            members,
            health,
            records,
            published,
        }
    }

    /// Whether the own request, if any, is the one the peers see
    fn request_published(&self) -> bool {
        match &self.own().request {
            Some(own) => self.published.request.as_ref().map(|r| r.id) == Some(own.id),
            None => true,
        }
    }

    pub fn own(&self) -> &RollingRecord {
        self.records.get(&self.me).unwrap_or(&EMPTY_RECORD)
    }

    pub fn set_own(&mut self, record: RollingRecord) {
        self.records.insert(self.me.clone(), record);
    }

    fn record(&self, unit: &UnitId) -> &RollingRecord {
        self.records.get(unit).unwrap_or(&EMPTY_RECORD)
    }

    fn max_seen(&self) -> OpId {
        let mut max = 0;
        for record in self.records.values() {
            max = max.max(record.sequence);
            if let Some(req) = &record.request {
                max = max.max(req.id);
            }
            for step in &record.steps {
                max = max.max(step.op_id);
            }
            if let Some(done) = &record.completed {
                max = max.max(done.op_id);
            }
        }
        max
    }

    /// Pending requests of live members, ordered by `(id, owner)`
    pub fn pending(&self) -> Vec<(UnitId, OperationRequest)> {
        let mut pending: Vec<(UnitId, OperationRequest)> = self
            .members
            .iter()
            .filter_map(|u| self.record(u).request.clone().map(|r| (u.clone(), r)))
            .collect();
        pending.sort_by(|a, b| (a.1.id, &a.0).cmp(&(b.1.id, &b.0)));
        pending
    }

    fn is_pending(&self, owner: &UnitId, op_id: OpId) -> bool {
        self.members.contains(owner)
            && self
                .record(owner)
                .request
                .as_ref()
                .map(|r| r.id == op_id)
                .unwrap_or(false)
    }

    pub fn participants(&self, owner: &UnitId, request: &OperationRequest) -> Vec<UnitId> {
        let excluded = &self.record(owner).excluded;
        let candidates: Vec<UnitId> = match request.scope {
            OperationScope::Cluster => self.members.clone(),
            OperationScope::Unit => vec![owner.clone()],
        };
        candidates
            .into_iter()
            .filter(|u| self.members.contains(u) && !excluded.contains(u))
            .collect()
    }

    fn step_of(&self, unit: &UnitId, owner: &UnitId, op_id: OpId) -> Option<&StepRecord> {
        self.record(unit).step(owner, op_id)
    }

    fn acked(&self, unit: &UnitId, owner: &UnitId, op_id: OpId) -> bool {
        self.step_of(unit, owner, op_id)
            .map(|s| s.state == StepState::Done)
            .unwrap_or(false)
    }

    fn is_complete(&self, owner: &UnitId, request: &OperationRequest) -> bool {
        self.participants(owner, request)
            .iter()
            .all(|u| self.acked(u, owner, request.id))
    }

    /// Lowest pending operation that still waits on someone
    pub fn active(&self) -> Option<(UnitId, OperationRequest)> {
        self.pending()
            .into_iter()
            .find(|(owner, req)| !self.is_complete(owner, req))
    }

    /// A participant currently mid-step, if any
    pub fn running(&self) -> Option<(UnitId, StepRecord)> {
        for (owner, req) in self.pending() {
            for unit in self.participants(&owner, &req) {
                if let Some(step) = self.step_of(&unit, &owner, req.id) {
                    if step.state == StepState::Running {
                        return Some((unit, step.clone()));
                    }
                }
            }
        }
        None
    }

    fn has_started(&self, owner: &UnitId, op_id: OpId) -> bool {
        self.records.values().any(|r| r.step(owner, op_id).is_some())
    }

    /// Units excluded by some operation that have not come back healthy
    pub fn degraded_units(&self) -> Vec<UnitId> {
        let mut units = BTreeSet::new();
        for unit in &self.members {
            let record = self.record(unit);
            units.extend(record.excluded.iter().cloned());
            if let Some(CompletionRecord {
                status: CompletionStatus::CompletedDegraded { excluded },
                ..
            }) = &record.completed
            {
                units.extend(excluded.iter().cloned());
            }
        }
        units
            .into_iter()
            .filter(|u| {
                self.members.contains(u)
                    && self.health.get(u).copied().unwrap_or_default() != UnitHealth::Healthy
            })
            .collect()
    }
}

static EMPTY_RECORD: RollingRecord = RollingRecord {
    request: None,
    excluded: Vec::new(),
    steps: Vec::new(),
    joined: None,
    completed: None,
    supersessions: Vec::new(),
    sequence: 0,
};

/// Outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was posted with this id
    Posted(OpId),
    /// An already pending operation covers the need
    Joined { owner: UnitId, op_id: OpId },
    /// The own pending request was replaced
    Superseded { old_id: OpId, new_id: OpId },
}

/// Result of one evaluation of the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub record: RollingRecord,
    pub execute: Option<StepOrder>,
    pub completed: Option<CompletionRecord>,
    /// Units this unit excluded during the evaluation
    pub excluded: Vec<UnitId>,
    pub degraded: Vec<UnitId>,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    timeout: Duration,
}

impl Coordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Register a need, joining a pending operation when one covers it.
    pub fn request(
        &self,
        view: &PeerView,
        need: &Need,
        now: DateTime<Utc>,
    ) -> (RollingRecord, RequestOutcome) {
        let me = &view.me;
        let mut record = view.own().clone();

        if let Some(own) = record.request.clone() {
            let own_started = record.step(me, own.id).is_some();
            let scope_ok =
                own.scope == OperationScope::Cluster || need.scope == OperationScope::Unit;
            if own.kind.covers(need.kind) && scope_ok && !own_started {
                return (
                    record,
                    RequestOutcome::Joined {
                        owner: me.clone(),
                        op_id: own.id,
                    },
                );
            }

            let new_id = view.max_seen().max(record.sequence) + 1;
            info!(
                unit = %me,
                old_id = own.id,
                new_id,
                reason = %need.reason,
                "Superseding pending rolling operation"
            );
            record.supersede(SupersessionRecord {
                old_id: own.id,
                new_id: Some(new_id),
                reason: format!("superseded: {}", need.reason),
                at: now,
            });
            // peers that have not had their turn still need the old kind
            let kind = strongest(own.kind, need.kind);
            let scope = if own.scope == OperationScope::Cluster {
                OperationScope::Cluster
            } else {
                need.scope
            };
            post(&mut record, new_id, kind, scope, &need.reason, now);
            return (
                record,
                RequestOutcome::Superseded {
                    old_id: own.id,
                    new_id,
                },
            );
        }

        for (owner, req) in view.pending() {
            if &owner == me || req.scope != OperationScope::Cluster {
                continue;
            }
            let participant = view.participants(&owner, &req).contains(me);
            if participant && req.kind.covers(need.kind) && record.step(&owner, req.id).is_none() {
                debug!(
                    unit = %me,
                    owner = %owner,
                    op_id = req.id,
                    "Joining pending rolling operation"
                );
                record.joined = Some(JoinedOp {
                    owner: owner.clone(),
                    op_id: req.id,
                    kind: need.kind,
                });
                return (record, RequestOutcome::Joined { owner, op_id: req.id });
            }
        }

        let id = view.max_seen().max(record.sequence) + 1;
        post(&mut record, id, need.kind, need.scope, &need.reason, now);
        info!(
            unit = %me,
            op_id = id,
            kind = ?need.kind,
            reason = %need.reason,
            "Posted rolling operation"
        );
        (record, RequestOutcome::Posted(id))
    }

    /// Mark the local step of `(owner, op_id)` done.
    pub fn finish_step(
        &self,
        view: &PeerView,
        owner: &UnitId,
        op_id: OpId,
        now: DateTime<Utc>,
    ) -> RollingRecord {
        let mut record = view.own().clone();
        match record
            .steps
            .iter_mut()
            .find(|s| &s.owner == owner && s.op_id == op_id)
        {
            Some(step) => {
                step.state = StepState::Done;
                step.finished_at = Some(now);
            }
            None => record.steps.push(StepRecord {
                op_id,
                owner: owner.clone(),
                state: StepState::Done,
                started_at: now,
                finished_at: Some(now),
            }),
        }
        debug!(unit = %view.me, owner = %owner, op_id, "Finished rolling step");
        record
    }

    /// Evaluate the protocol for this unit: resolve id conflicts, perform
    /// owner duties, and decide whether to execute a step now.
    pub fn tick(&self, view: &PeerView, now: DateTime<Utc>) -> Tick {
        let me = view.me.clone();
        let mut view = view.clone();
        let mut record = view.own().clone();
        let mut excluded_now = Vec::new();
        let mut completed = None;

        // same-id conflicts
        if let Some(own) = record.request.clone() {
            let winner = view
                .pending()
                .into_iter()
                .find(|(owner, req)| req.id == own.id && owner < &me);
            if let Some((winner, winning)) = winner {
                let conflict = OperatorError::PeerProtocolConflict(format!(
                    "op {} posted by both {} and {}",
                    own.id, winner, me
                ));
                debug!(unit = %me, error = %conflict, "Resolving rolling operation conflict");

                let covered = winning.scope == OperationScope::Cluster
                    && winning.kind.covers(own.kind)
                    && (own.scope == OperationScope::Unit
                        || winning.scope == OperationScope::Cluster)
                    && record.step(&winner, winning.id).is_none();
                if covered && !view.has_started(&me, own.id) {
                    record.request = None;
                    record.excluded.clear();
                    record.joined = Some(JoinedOp {
                        owner: winner.clone(),
                        op_id: winning.id,
                        kind: own.kind,
                    });
                    record.supersede(SupersessionRecord {
                        old_id: own.id,
                        new_id: None,
                        reason: format!("withdrawn in favour of {} op {}", winner, winning.id),
                        at: now,
                    });
                } else {
                    let new_id = view.max_seen().max(record.sequence) + 1;
                    record.supersede(SupersessionRecord {
                        old_id: own.id,
                        new_id: Some(new_id),
                        reason: format!("id conflict with {}", winner),
                        at: now,
                    });
                    post(&mut record, new_id, own.kind, own.scope, &own.reason, now);
                }
                view.set_own(record.clone());
            }
        }

        // a joined operation that vanished before covering us becomes our own
        if let Some(joined) = record.joined.clone() {
            let done = view.acked(&me, &joined.owner, joined.op_id);
            if done {
                record.joined = None;
            } else if !view.is_pending(&joined.owner, joined.op_id)
                || view.record(&joined.owner).excluded.contains(&me)
            {
                record.joined = None;
                if record.request.is_none() {
                    let id = view.max_seen().max(record.sequence) + 1;
                    info!(
                        unit = %me,
                        owner = %joined.owner,
                        op_id = joined.op_id,
                        new_id = id,
                        "Joined operation vanished, reposting"
                    );
                    post(
                        &mut record,
                        id,
                        joined.kind,
                        OperationScope::Unit,
                        "joined operation did not complete",
                        now,
                    );
                }
            }
            view.set_own(record.clone());
        }

        // owner duties
        while let Some(own) = record.request.clone() {
            let participants = view.participants(&me, &own);
            if participants.iter().all(|u| view.acked(u, &me, own.id)) {
                let status = if record.excluded.is_empty() {
                    CompletionStatus::Completed
                } else {
                    CompletionStatus::CompletedDegraded {
                        excluded: record.excluded.clone(),
                    }
                };
                let done = CompletionRecord {
                    op_id: own.id,
                    kind: own.kind,
                    status,
                    at: now,
                };
                info!(
                    unit = %me,
                    op_id = own.id,
                    status = ?done.status,
                    "Rolling operation complete"
                );
                record.completed = Some(done.clone());
                record.request = None;
                record.excluded.clear();
                completed = Some(done);
                view.set_own(record.clone());
                break;
            }

            // the clock only runs while this operation holds the turn
            let holds_turn = view
                .active()
                .map(|(owner, req)| owner == me && req.id == own.id)
                .unwrap_or(false);
            if !holds_turn {
                break;
            }
            let active_since = match own.active_since {
                Some(at) => at,
                None => {
                    record.request = Some(OperationRequest {
                        active_since: Some(now),
                        ..own.clone()
                    });
                    view.set_own(record.clone());
                    now
                }
            };

            let running = participants.iter().find_map(|u| {
                view.step_of(u, &me, own.id)
                    .filter(|s| s.state == StepState::Running)
                    .map(|s| (u.clone(), s.started_at))
            });
            let (candidate, turn_start) = match running {
                Some((unit, started_at)) => (unit, started_at),
                None => {
                    let next = participants
                        .iter()
                        .find(|u| !view.acked(u, &me, own.id))
                        .cloned();
                    let last_ack = participants
                        .iter()
                        .filter_map(|u| view.step_of(u, &me, own.id).and_then(|s| s.finished_at))
                        .max();
                    let turn_start = last_ack.map_or(active_since, |t| t.max(active_since));
                    match next {
                        Some(next) => (next, turn_start),
                        None => break,
                    }
                }
            };

            if candidate == me || now - turn_start <= self.timeout {
                break;
            }
            let health = view.health.get(&candidate).copied().unwrap_or_default();
            if health == UnitHealth::Healthy {
                debug!(
                    unit = %me,
                    peer = %candidate,
                    op_id = own.id,
                    "Peer overdue but healthy, waiting"
                );
                break;
            }
            let timeout = OperatorError::PeerTimeout(format!(
                "{} did not complete op {} within {}s",
                candidate,
                own.id,
                self.timeout.num_seconds()
            ));
            warn!(
                unit = %me,
                peer = %candidate,
                op_id = own.id,
                error = %timeout,
                "Excluding peer from rolling operation"
            );
            record.excluded.push(candidate.clone());
            record.excluded.sort();
            excluded_now.push(candidate);
            view.set_own(record.clone());
        }

        // execution
        let mut execute = None;
        if let Some((owner, req)) = view.active() {
            let participants = view.participants(&owner, &req);
            let started = record.step(&owner, req.id).is_some();
            if participants.contains(&me) && !started && view.running().is_none() {
                let next = participants
                    .iter()
                    .find(|u| !view.acked(u, &owner, req.id));
                if next == Some(&me) && !view.request_published() {
                    debug!(
                        unit = %me,
                        owner = %owner,
                        op_id = req.id,
                        "Own request not published yet, deferring step"
                    );
                } else if next == Some(&me) {
                    info!(
                        unit = %me,
                        owner = %owner,
                        op_id = req.id,
                        kind = ?req.kind,
                        "Starting rolling step"
                    );
                    record.steps.push(StepRecord {
                        op_id: req.id,
                        owner: owner.clone(),
                        state: StepState::Running,
                        started_at: now,
                        finished_at: None,
                    });
                    execute = Some(StepOrder {
                        owner,
                        op_id: req.id,
                        kind: req.kind,
                    });
                    view.set_own(record.clone());
                }
            }
        }

        // forget steps of operations that are no longer pending
        let before = record.steps.len();
        record.steps.retain(|s| {
            view.is_pending(&s.owner, s.op_id)
                && !(s.owner == me && record_completed(&completed, s.op_id))
        });
        if record.steps.len() != before {
            view.set_own(record.clone());
        }

        Tick {
            degraded: view.degraded_units(),
            record,
            execute,
            completed,
            excluded: excluded_now,
        }
    }
}

fn record_completed(completed: &Option<CompletionRecord>, op_id: OpId) -> bool {
    completed.as_ref().map(|c| c.op_id == op_id).unwrap_or(false)
}

fn strongest(a: OperationKind, b: OperationKind) -> OperationKind {
    if a == OperationKind::StorageRestart || b == OperationKind::StorageRestart {
        OperationKind::StorageRestart
    } else {
        b
    }
}

fn post(
    record: &mut RollingRecord,
    id: OpId,
    kind: OperationKind,
    scope: OperationScope,
    reason: &str,
    now: DateTime<Utc>,
) {
    record.request = Some(OperationRequest {
        id,
        kind,
        scope,
        requested_at: now,
        reason: reason.to_string(),
        active_since: None,
    });
    record.excluded.clear();
    record.joined = None;
    record.sequence = id;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::relation::{BagOwner, Interface};

    fn unit(n: u32) -> UnitId {
        UnitId::new("kafka", n)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn need(kind: OperationKind, scope: OperationScope) -> Need {
        Need {
            kind,
            scope,
            reason: "test".to_string(),
        }
    }

    /// Shared bag state for a handful of units
    struct Cluster {
        relation: Relation,
        members: Vec<UnitId>,
        health: BTreeMap<UnitId, UnitHealth>,
    }

    impl Cluster {
        fn new(n: u32) -> Self {
            let members: Vec<UnitId> = (0..n).map(unit).collect();
            let health = members.iter().map(|u| (u.clone(), UnitHealth::Healthy)).collect();
            Self {
                relation: Relation::new(1, Interface::Restart, "kafka"),
                members,
                health,
            }
        }

        fn view(&self, me: u32) -> PeerView {
            PeerView::from_relation(&unit(me), &self.members, self.health.clone(), &self.relation)
        }

        fn write(&mut self, me: u32, record: &RollingRecord) {
            self.relation.set(
                BagOwner::Unit(unit(me)),
                ROLLING_KEY,
                Some(record.encode().unwrap()),
            );
        }

        fn tick(&mut self, coord: &Coordinator, me: u32, now: DateTime<Utc>) -> Tick {
            let tick = coord.tick(&self.view(me), now);
            self.write(me, &tick.record);
            tick
        }

        fn finish(&mut self, coord: &Coordinator, me: u32, order: &StepOrder, now: DateTime<Utc>) {
            let record = coord.finish_step(&self.view(me), &order.owner, order.op_id, now);
            self.write(me, &record);
        }
    }

    #[test]
    fn test_kind_coverage() {
        assert!(OperationKind::StorageRestart.covers(OperationKind::Restart));
        assert!(OperationKind::Restart.covers(OperationKind::RotateCredentials));
        assert!(!OperationKind::Restart.covers(OperationKind::StorageRestart));
    }

    #[test]
    fn test_request_uses_next_id() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(3);
        let mut seeded = RollingRecord::default();
        seeded.sequence = 4;
        cluster.write(0, &seeded);

        let (record, outcome) = coord.request(

            &cluster.view(0),

            &need(OperationKind::Restart, OperationScope::Cluster),

            t(0),

        );
        assert_eq!(outcome, RequestOutcome::Posted(5));
        assert_eq!(record.request.as_ref().unwrap().id, 5);
        cluster.write(0, &record);

        // another unit with the same need joins instead of posting
        let (record, outcome) = coord.request(
            &cluster.view(1),
            &need(OperationKind::Restart, OperationScope::Unit),
            t(1),
        );
        assert_eq!(outcome, RequestOutcome::Joined { owner: unit(0), op_id: 5 });
        assert!(record.request.is_none());
        assert_eq!(record.joined.as_ref().unwrap().op_id, 5);
    }

    #[test]
    fn test_cluster_restart_runs_one_unit_at_a_time() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(3);
        let (record, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &record);

        let first = cluster.tick(&coord, 0, t(1)).execute.expect("unit 0 goes first");
        assert!(cluster.tick(&coord, 1, t(2)).execute.is_none());
        assert!(cluster.tick(&coord, 2, t(2)).execute.is_none());

        cluster.finish(&coord, 0, &first, t(3));
        let second = cluster.tick(&coord, 1, t(4)).execute.expect("unit 1 next");
        assert!(cluster.tick(&coord, 2, t(4)).execute.is_none());
        cluster.finish(&coord, 1, &second, t(5));

        let third = cluster.tick(&coord, 2, t(6)).execute.expect("unit 2 last");
        cluster.finish(&coord, 2, &third, t(7));

        let done = cluster.tick(&coord, 0, t(8));
        let completed = done.completed.expect("owner completes");
        assert_eq!(completed.status, CompletionStatus::Completed);
        assert!(done.record.request.is_none());

        // participants forget their steps once the request is gone
        let tick = cluster.tick(&coord, 1, t(9));
        assert!(tick.record.steps.is_empty());
        assert!(tick.execute.is_none());
    }

    #[test]
    fn test_timeout_completes_degraded() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(3);
        let mut seeded = RollingRecord::default();
        seeded.sequence = 4;
        cluster.write(0, &seeded);
        let (record, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &record);

        let order = cluster.tick(&coord, 0, t(1)).execute.unwrap();
        assert_eq!(order.op_id, 5);
        cluster.finish(&coord, 0, &order, t(2));
        let order = cluster.tick(&coord, 1, t(3)).execute.unwrap();
        cluster.finish(&coord, 1, &order, t(4));

        // kafka/2 went away; nothing happens before the bound
        cluster.health.insert(unit(2), UnitHealth::Unhealthy);
        let early = cluster.tick(&coord, 0, t(500));
        assert!(early.completed.is_none());

        let late = cluster.tick(&coord, 0, t(4 + 601));
        assert_eq!(late.excluded, vec![unit(2)]);
        let completed = late.completed.expect("completes after exclusion");
        assert_eq!(completed.op_id, 5);
        assert_eq!(
            completed.status,
            CompletionStatus::CompletedDegraded {
                excluded: vec![unit(2)]
            }
        );
        assert_eq!(late.degraded, vec![unit(2)]);

        // degraded clears once the excluded unit is healthy again
        cluster.health.insert(unit(2), UnitHealth::Healthy);
        assert!(cluster.tick(&coord, 0, t(700)).degraded.is_empty());
    }

    #[test]
    fn test_running_step_timeout() {
        let coord = Coordinator::new(Duration::seconds(60));
        let mut cluster = Cluster::new(2);
        let (record, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &record);
        let order = cluster.tick(&coord, 0, t(1)).execute.unwrap();
        cluster.finish(&coord, 0, &order, t(2));
        assert!(cluster.tick(&coord, 1, t(3)).execute.is_some());

        // kafka/1 never finishes; it is only dropped once it is also unhealthy
        assert!(cluster.tick(&coord, 0, t(30)).excluded.is_empty());
        assert!(cluster.tick(&coord, 0, t(100)).excluded.is_empty());
        cluster.health.insert(unit(1), UnitHealth::Unhealthy);
        let tick = cluster.tick(&coord, 0, t(100));
        assert_eq!(tick.excluded, vec![unit(1)]);
        assert!(matches!(
            tick.completed.unwrap().status,
            CompletionStatus::CompletedDegraded { .. }
        ));
    }

    #[test]
    fn test_same_id_conflict_smaller_unit_wins() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(3);
        // both post before seeing each other
        let (r0, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        let (r2, _) = coord.request(
            &cluster.view(2),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        assert_eq!(r0.request.as_ref().unwrap().id, r2.request.as_ref().unwrap().id);
        cluster.write(0, &r0);
        cluster.write(2, &r2);

        let tick = cluster.tick(&coord, 2, t(1));
        assert!(tick.record.request.is_none());
        assert_eq!(tick.record.supersessions.len(), 1);
        assert_eq!(tick.record.supersessions[0].new_id, None);
        assert_eq!(tick.record.joined.as_ref().unwrap().owner, unit(0));
    }

    #[test]
    fn test_conflict_loser_reposts_when_not_covered() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(2);
        let (r0, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Unit),
            t(0),
        );
        let (r1, _) = coord.request(
            &cluster.view(1),
            &need(OperationKind::StorageRestart, OperationScope::Unit),
            t(0),
        );
        cluster.write(0, &r0);
        cluster.write(1, &r1);

        let tick = cluster.tick(&coord, 1, t(1));
        let req = tick.record.request.clone().unwrap();
        assert_eq!(req.id, 2);
        assert_eq!(req.kind, OperationKind::StorageRestart);
        assert_eq!(tick.record.supersessions[0].old_id, 1);
        assert_eq!(tick.record.supersessions[0].new_id, Some(2));
    }

    #[test]
    fn test_supersede_in_progress_operation() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(2);
        let (record, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &record);
        let order = cluster.tick(&coord, 0, t(1)).execute.unwrap();
        cluster.finish(&coord, 0, &order, t(2));

        // another change arrives after our own step
        let (record, outcome) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(3),
        );
        assert_eq!(outcome, RequestOutcome::Superseded { old_id: 1, new_id: 2 });
        assert_eq!(record.supersessions.len(), 1);
        cluster.write(0, &record);
        assert_eq!(cluster.tick(&coord, 0, t(4)).execute.unwrap().op_id, 2);
    }

    #[test]
    fn test_unit_scope_only_involves_owner() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(3);
        let (record, _) = coord.request(
            &cluster.view(1),
            &need(OperationKind::StorageRestart, OperationScope::Unit),
            t(0),
        );
        cluster.write(1, &record);
        assert!(cluster.tick(&coord, 0, t(1)).execute.is_none());
        let order = cluster.tick(&coord, 1, t(1)).execute.unwrap();
        assert_eq!(order.kind, OperationKind::StorageRestart);
        cluster.finish(&coord, 1, &order, t(2));
        assert!(cluster.tick(&coord, 1, t(3)).completed.is_some());
    }

    #[test]
    fn test_departed_owner_operation_vanishes() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(2);
        let (record, _) = coord.request(
            &cluster.view(1),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(1, &record);
        let (joined, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Unit),
            t(1),
        );
        cluster.write(0, &joined);

        cluster.members.retain(|u| u != &unit(1));
        let tick = cluster.tick(&coord, 0, t(2));
        // the need survives as an own request, executed once published
        assert!(tick.record.request.is_some());
        assert!(tick.execute.is_none());
        assert!(cluster.tick(&coord, 0, t(3)).execute.is_some());
    }

    #[test]
    fn test_overlapping_requests_never_execute_together() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(2);
        let restart = need(OperationKind::Restart, OperationScope::Unit);

        // both units decide against the same empty bags
        let stale = [cluster.view(0), cluster.view(1)];
        let mut posted = Vec::new();
        for mut view in stale {
            let (record, outcome) = coord.request(&view, &restart, t(0));
            assert_eq!(outcome, RequestOutcome::Posted(1));
            view.set_own(record);
            let tick = coord.tick(&view, t(0));
            assert!(tick.execute.is_none());
            posted.push(tick.record);
        }
        cluster.write(0, &posted[0]);
        cluster.write(1, &posted[1]);

        let mut executed: Vec<Vec<u32>> = Vec::new();
        let mut now = 1;
        while executed.iter().flatten().count() < 2 {
            assert!(now < 20, "rolling restart did not finish");
            // every unit of a round sees the same published bags
            let views: Vec<PeerView> = (0..2).map(|i| cluster.view(i)).collect();
            let ticks: Vec<Tick> = views.iter().map(|v| coord.tick(v, t(now))).collect();
            let round: Vec<u32> = (0..2u32)
                .filter(|i| ticks[*i as usize].execute.is_some())
                .collect();
            assert!(round.len() <= 1, "units {:?} executed together", round);
            for (i, tick) in ticks.into_iter().enumerate() {
                cluster.write(i as u32, &tick.record);
                if let Some(order) = tick.execute {
                    cluster.finish(&coord, i as u32, &order, t(now));
                }
            }
            executed.push(round);
            now += 1;
        }
        // the smaller unit wins the shared id, the other reposts first
        assert_eq!(executed.into_iter().flatten().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_queued_operation_does_not_time_out_peers() {
        let coord = Coordinator::new(Duration::seconds(600));
        let mut cluster = Cluster::new(2);
        let (r0, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &r0);
        let (r1, outcome) = coord.request(
            &cluster.view(1),
            &need(OperationKind::StorageRestart, OperationScope::Cluster),
            t(0),
        );
        assert_eq!(outcome, RequestOutcome::Posted(2));
        cluster.write(1, &r1);

        let order = cluster.tick(&coord, 0, t(1)).execute.unwrap();
        assert_eq!(order.op_id, 1);
        cluster.finish(&coord, 0, &order, t(400));

        // op 2 waits behind op 1; its clock has not started
        let tick = cluster.tick(&coord, 1, t(650));
        assert!(tick.excluded.is_empty());
        assert!(tick.record.excluded.is_empty());
        assert_eq!(tick.execute.map(|o| o.op_id), Some(1));
        assert!(tick.record.request.as_ref().unwrap().active_since.is_none());
    }

    #[test]
    fn test_overdue_healthy_peer_is_not_excluded() {
        let coord = Coordinator::new(Duration::seconds(60));
        let mut cluster = Cluster::new(2);
        let (record, _) = coord.request(
            &cluster.view(0),
            &need(OperationKind::Restart, OperationScope::Cluster),
            t(0),
        );
        cluster.write(0, &record);
        let order = cluster.tick(&coord, 0, t(1)).execute.unwrap();
        cluster.finish(&coord, 0, &order, t(2));

        // kafka/1 never takes its turn but keeps reporting healthy
        let tick = cluster.tick(&coord, 0, t(500));
        assert!(tick.excluded.is_empty());
        assert!(tick.completed.is_none());
        assert_eq!(tick.record.request.as_ref().unwrap().active_since, Some(t(1)));
    }

    #[test]
    fn test_record_wire_format() {
        let record = RollingRecord {
            completed: Some(CompletionRecord {
                op_id: 5,
                kind: OperationKind::Restart,
                status: CompletionStatus::CompletedDegraded {
                    excluded: vec![unit(2)],
                },
                at: t(0),
            }),
            sequence: 5,
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&record.encode().unwrap()).unwrap();
        assert_eq!(json["completed"]["status"], "completed-degraded");
        assert_eq!(json["completed"]["excluded"][0], "kafka/2");
        assert!(json.get("request").is_none());
        assert_eq!(RollingRecord::decode(&record.encode().unwrap()).unwrap(), record);
        assert!(RollingRecord::decode("{").is_err());
    }
}
