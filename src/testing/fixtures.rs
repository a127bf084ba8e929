//! Canned relations, snapshots and states for a small `kafka` cluster

use chrono::{DateTime, TimeZone, Utc};

use crate::controllers::resolver::{DesiredConfig, Resolver, ResolverInput};
use crate::controllers::state::{Snapshot, UnitState};
use crate::controllers::storage::StorageState;
use crate::model::config::CharmConfig;
use crate::model::relation::{BagOwner, DataBag, Interface, Relation, RelationId, RelationSet};
use crate::model::storage::{ByteSize, Volume};
use crate::model::unit::{PeerUnit, UnitId};
use crate::settings::OperatorSettings;

pub const APP: &str = "kafka";
pub const CLUSTER_ID: RelationId = 0;
pub const RESTART_ID: RelationId = 1;
pub const ZOOKEEPER_ID: RelationId = 2;
pub const CERTIFICATES_ID: RelationId = 20;

pub fn unit(index: u32) -> UnitId {
    UnitId::new(APP, index)
}

pub fn members(n: u32) -> Vec<UnitId> {
    (0..n).map(unit).collect()
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn bag(pairs: &[(&str, &str)]) -> DataBag {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Private address published for `kafka/<index>`
pub fn address(index: u32) -> String {
    format!("10.0.0.{}", 10 + index)
}

/// Peer, restart and ZooKeeper relations for an `n`-unit cluster that has
/// already bootstrapped its internal credentials. With `tls`, ZooKeeper
/// advertises TLS and a certificates relation carries valid PEM material.
pub fn relations(n: u32, tls: bool) -> RelationSet {
    let mut set = RelationSet::default();

    let mut cluster = Relation::new(CLUSTER_ID, Interface::Cluster, APP);
    cluster.units = members(n);
    cluster.bags.insert(
        BagOwner::App(APP.to_string()),
        bag(&[
            ("sync-password", "sync-secret"),
            ("admin-password", "admin-secret"),
            ("broker-creds", "added"),
        ]),
    );
    for i in 0..n {
        cluster.set(
            BagOwner::Unit(unit(i)),
            "private-address",
            Some(address(i)),
        );
    }
    set.insert(cluster);

    let mut restart = Relation::new(RESTART_ID, Interface::Restart, APP);
    restart.units = members(n);
    set.insert(restart);

    let mut zookeeper = Relation::new(ZOOKEEPER_ID, Interface::Zookeeper, "zookeeper");
    zookeeper.bags.insert(
        BagOwner::App("zookeeper".to_string()),
        bag(&[
            ("chroot", "/kafka"),
            ("username", "zkuser"),
            ("password", "zkpass"),
            ("endpoints", "1.1.1.1,2.2.2.2"),
            ("uris", "1.1.1.1:2181/kafka,2.2.2.2:2181/kafka"),
            ("tls", if tls { "enabled" } else { "disabled" }),
        ]),
    );
    set.insert(zookeeper);

    if tls {
        set.insert(certificates_relation(CERTIFICATES_ID, &super::pem_material()));
    }
    set
}

pub fn certificates_relation(id: RelationId, material: &DataBag) -> Relation {
    let mut relation = Relation::new(id, Interface::Certificates, "tls-certificates");
    relation
        .bags
        .insert(BagOwner::App("tls-certificates".to_string()), material.clone());
    relation
}

/// A client application asking for `TOPIC` with the given roles
pub fn client_relation(id: RelationId, app: &str, roles: &str) -> Relation {
    let mut relation = Relation::new(id, Interface::KafkaClient, app);
    relation.bags.insert(
        BagOwner::App(app.to_string()),
        bag(&[("topic", "TOPIC"), ("extra-user-roles", roles)]),
    );
    relation
}

/// What `kafka/<index>` sees in an `n`-unit cluster. `kafka/0` leads.
pub fn snapshot(index: u32, n: u32, tls: bool) -> Snapshot {
    Snapshot {
        unit: unit(index),
        leader: Some(index == 0),
        config: CharmConfig::default(),
        relations: relations(n, tls),
        peers: (0..n)
            .filter(|i| *i != index)
            .map(|i| PeerUnit::healthy(unit(i)))
            .collect(),
        broker_active: false,
        now: now(),
        published: None,
    }
}

pub fn ready_storage() -> StorageState {
    StorageState {
        volumes: vec![Volume::new("log-data/0", ByteSize::gib(10))],
    }
}

/// Installed unit with one qualifying volume, not yet configured
pub fn ready_state() -> UnitState {
    UnitState {
        installed: true,
        storage: ready_storage(),
        ..Default::default()
    }
}

/// Resolved config for `kafka/0`: a single plaintext broker, or a
/// three-broker TLS cluster.
pub fn desired_config(tls: bool) -> DesiredConfig {
    let n = if tls { 3 } else { 1 };
    let resolver = match Resolver::new(OperatorSettings::default()) {
        Ok(resolver) => resolver,
        Err(e) => panic!("default settings rejected: {}", e),
    };
    let relations = relations(n, tls);
    let members = members(n);
    let storage = ready_storage();
    match resolver.resolve(&ResolverInput {
        unit: &unit(0),
        config: &CharmConfig::default(),
        relations: &relations,
        members: &members,
        storage: &storage,
    }) {
        Ok(desired) => desired,
        Err(e) => panic!("fixture config does not resolve: {}", e),
    }
}
