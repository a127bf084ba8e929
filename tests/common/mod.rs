//! Deterministic multi-unit simulation
//!
//! Every unit has its own store, workload and engine; they share one
//! [`RelationSet`] that stands in for the runtime's relation data. Relation
//! writes of an invocation become visible to everyone once it returns, the
//! way the runtime publishes them after a hook. Scheduling and clock jitter
//! come from a seeded ChaCha8 generator so failures reproduce.
//!
//! [`Sim::settle_overlapping`] also lets several units run against the same
//! stale world before any of them publishes, the way hooks of different
//! units overlap in a real deployment.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use kafka_operator::controllers::rolling::{RollingRecord, StepState, ROLLING_KEY};
use kafka_operator::model::relation::{Interface, RelationSet};
use kafka_operator::model::unit::{PeerUnit, UnitHealth, UnitId};
use kafka_operator::testing::{fixtures, RecordingWorkload, SequentialSecrets};
use kafka_operator::{
    Dispatcher, Engine, Event, InvocationReport, MemoryStore, OperatorSettings, Snapshot,
    UnitState,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub struct Node {
    pub dispatcher: Dispatcher<RecordingWorkload>,
    pub health: UnitHealth,
}

pub struct Sim {
    pub world: RelationSet,
    pub nodes: Vec<Node>,
    pub now: DateTime<Utc>,
    pub settings: OperatorSettings,
    rng: ChaCha8Rng,
}

impl Sim {
    pub fn new(n: u32, tls: bool, seed: u64) -> Self {
        let settings = OperatorSettings::default();
        let nodes = (0..n)
            .map(|_| {
                let secrets = Box::new(SequentialSecrets::default());
                let engine = Engine::with_secrets(settings.clone(), secrets)
                    .expect("default settings are valid");
                let store = Arc::new(MemoryStore::new());
                Node {
                    dispatcher: Dispatcher::new(engine, RecordingWorkload::new(), store),
                    health: UnitHealth::Healthy,
                }
            })
            .collect();
        Self {
            world: fixtures::relations(n, tls),
            nodes,
            now: fixtures::now(),
            settings,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn workload(&self, index: u32) -> &RecordingWorkload {
        self.nodes[index as usize].dispatcher.workload()
    }

    pub fn state(&self, index: u32) -> UnitState {
        self.nodes[index as usize]
            .dispatcher
            .state(&fixtures::unit(index))
            .expect("state readable")
    }

    pub fn advance(&mut self, secs: i64) {
        self.now += Duration::seconds(secs);
    }

    /// What `kafka/<index>` sees right now
    pub fn snapshot(&self, index: u32) -> Snapshot {
        let mut snapshot = fixtures::snapshot(index, self.len(), false);
        snapshot.relations = self.world.clone();
        snapshot.now = self.now;
        snapshot.peers = (0..self.len())
            .filter(|i| *i != index)
            .map(|i| PeerUnit {
                health: self.nodes[i as usize].health,
                ..PeerUnit::healthy(fixtures::unit(i))
            })
            .collect();
        snapshot
    }

    /// Run one invocation of `kafka/<index>` and publish its relation writes.
    pub async fn invoke(&mut self, index: u32, events: Vec<Event>) -> InvocationReport {
        let snapshot = self.snapshot(index);
        let report = self.run(index, snapshot, events).await;
        self.publish(&report);
        report
    }

    async fn run(
        &mut self,
        index: u32,
        snapshot: Snapshot,
        events: Vec<Event>,
    ) -> InvocationReport {
        self.nodes[index as usize]
            .dispatcher
            .dispatch(kafka_operator::Bundle { snapshot, events })
            .await
            .expect("dispatch does not fail on store errors")
    }

    fn publish(&mut self, report: &InvocationReport) {
        for write in &report.relation_writes {
            if let Some(relation) = self.world.by_id_mut(write.relation_id) {
                relation.set(write.owner.clone(), &write.key, write.value.clone());
            }
        }
        let running = self.running_steps();
        assert!(running <= 1, "{} units mid-step at once", running);
    }

    /// Run `indices` against one shared world and publish their writes only
    /// once all of them returned. Panics when more than one unit restarted
    /// within the batch.
    pub async fn invoke_overlapping(
        &mut self,
        indices: &[u32],
        event: Event,
    ) -> Vec<InvocationReport> {
        let before = self.restarts();
        let snapshots: Vec<Snapshot> = indices.iter().map(|i| self.snapshot(*i)).collect();
        let mut reports = Vec::new();
        for (index, snapshot) in indices.iter().zip(snapshots) {
            let report = self.run(*index, snapshot, vec![event.clone()]).await;
            reports.push(report);
        }
        for report in &reports {
            self.publish(report);
        }

        let restarted: Vec<UnitId> = self
            .restarts()
            .into_iter()
            .filter(|(unit, count)| before.get(unit).copied().unwrap_or(0) < *count)
            .map(|(unit, _)| unit)
            .collect();
        assert!(
            restarted.len() <= 1,
            "{:?} restarted within one overlapping batch",
            restarted
        );
        reports
    }

    /// Like [`Sim::settle`], but every round splits the healthy units into
    /// randomly sized overlapping batches.
    pub async fn settle_overlapping(&mut self, event: Event, max_rounds: usize) -> usize {
        let mut order: Vec<u32> = (0..self.len()).collect();
        for round in 1..=max_rounds {
            order.shuffle(&mut self.rng);
            let healthy: Vec<u32> = order
                .iter()
                .copied()
                .filter(|i| self.nodes[*i as usize].health == UnitHealth::Healthy)
                .collect();
            let mut writes = 0;
            let mut rest = healthy.as_slice();
            while !rest.is_empty() {
                let size = self.rng.gen_range(1..=rest.len());
                let (batch, tail) = rest.split_at(size);
                rest = tail;
                let jitter = self.rng.gen_range(1..30);
                self.advance(jitter);
                for report in self.invoke_overlapping(batch, event.clone()).await {
                    writes += report.relation_writes.len();
                }
            }
            if writes == 0 {
                return round;
            }
        }
        panic!("no fixed point after {} rounds", max_rounds);
    }

    /// Install every unit and attach one qualifying volume, leader first.
    pub async fn boot(&mut self) {
        let volume = fixtures::ready_storage().volumes[0].clone();
        for index in 0..self.len() {
            let report = self
                .invoke(
                    index,
                    vec![
                        Event::Install,
                        Event::StorageAttached {
                            volume: volume.clone(),
                        },
                    ],
                )
                .await;
            assert!(report.error.is_none(), "boot of kafka/{} failed: {:?}", index, report.error);
        }
    }

    /// Deliver `event` to every healthy unit in a shuffled order, repeating
    /// rounds until nobody writes relation data any more. Returns the number
    /// of rounds it took.
    pub async fn settle(&mut self, event: Event, max_rounds: usize) -> usize {
        let mut order: Vec<u32> = (0..self.len()).collect();
        for round in 1..=max_rounds {
            order.shuffle(&mut self.rng);
            let mut writes = 0;
            for &index in &order {
                if self.nodes[index as usize].health != UnitHealth::Healthy {
                    continue;
                }
                let jitter = self.rng.gen_range(1..30);
                self.advance(jitter);
                let report = self.invoke(index, vec![event.clone()]).await;
                writes += report.relation_writes.len();
            }
            if writes == 0 {
                return round;
            }
        }
        panic!("no fixed point after {} rounds", max_rounds);
    }

    pub fn rolling_record(&self, index: u32) -> RollingRecord {
        self.world
            .get(Interface::Restart)
            .and_then(|r| r.unit_bag(&fixtures::unit(index)).get(ROLLING_KEY).cloned())
            .map(|raw| RollingRecord::decode(&raw).expect("well-formed record"))
            .unwrap_or_default()
    }

    fn running_steps(&self) -> usize {
        (0..self.len())
            .filter(|i| {
                self.rolling_record(*i)
                    .steps
                    .iter()
                    .any(|s| s.state == StepState::Running)
            })
            .count()
    }

    /// Restart-like calls made against each unit's workload
    pub fn restarts(&self) -> BTreeMap<UnitId, usize> {
        (0..self.len())
            .map(|i| {
                let count = self
                    .workload(i)
                    .calls()
                    .iter()
                    .filter(|c| {
                        matches!(
                            c,
                            kafka_operator::testing::WorkloadCall::Restart
                                | kafka_operator::testing::WorkloadCall::DisableEnable
                        )
                    })
                    .count();
                (fixtures::unit(i), count)
            })
            .collect()
    }
}
