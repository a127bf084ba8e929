//! Relation model: the declared integration points and their data bags

use std::collections::BTreeMap;
use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::model::unit::UnitId;

pub type RelationId = u32;

/// Loosely typed key-value bag as carried on the wire
pub type DataBag = BTreeMap<String, String>;

/// Key writes turning `current` into `desired`; `None` deletes a key.
pub fn diff_bags(current: &DataBag, desired: &DataBag) -> Vec<(String, Option<String>)> {
    let mut writes = Vec::new();
    for (key, value) in desired {
        if current.get(key) != Some(value) {
            writes.push((key.clone(), Some(value.clone())));
        }
    }
    for key in current.keys() {
        if !desired.contains_key(key) {
            writes.push((key.clone(), None));
        }
    }
    writes
}

/// Declared relation endpoints
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum Interface {
    /// Peer relation carrying cluster membership and shared secrets
    Cluster,
    /// Peer relation carrying rolling-operation records
    Restart,
    Zookeeper,
    Certificates,
    KafkaClient,
    MetricsEndpoint,
    GrafanaDashboard,
}

/// Which side of the relation this application is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    Peer,
    Requires,
    Provides,
}

impl Interface {
    pub const ALL: [Interface; 7] = [
        Interface::Cluster,
        Interface::Restart,
        Interface::Zookeeper,
        Interface::Certificates,
        Interface::KafkaClient,
        Interface::MetricsEndpoint,
        Interface::GrafanaDashboard,
    ];

    pub fn endpoint(&self) -> &'static str {
        match self {
            Interface::Cluster => "cluster",
            Interface::Restart => "restart",
            Interface::Zookeeper => "zookeeper",
            Interface::Certificates => "certificates",
            Interface::KafkaClient => "kafka-client",
            Interface::MetricsEndpoint => "metrics-endpoint",
            Interface::GrafanaDashboard => "grafana-dashboard",
        }
    }

    pub fn scope(&self) -> RelationScope {
        match self {
            Interface::Cluster | Interface::Restart => RelationScope::Peer,
            Interface::Zookeeper | Interface::Certificates => RelationScope::Requires,
            Interface::KafkaClient | Interface::MetricsEndpoint | Interface::GrafanaDashboard => {
                RelationScope::Provides
            }
        }
    }

    /// Maximum number of simultaneous relations on this endpoint
    pub fn limit(&self) -> Option<usize> {
        match self {
            Interface::Cluster | Interface::Restart => Some(1),
            Interface::Zookeeper => Some(1),
            Interface::Certificates => Some(1),
            Interface::KafkaClient | Interface::MetricsEndpoint | Interface::GrafanaDashboard => {
                None
            }
        }
    }

    pub fn from_endpoint(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.endpoint() == name)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Participant owning a data bag.
///
/// Written on the wire as the bare application name or unit name; unit
/// names always contain a `/`, application names never do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BagOwner {
    /// Application-level bag; only the leader of that application writes it
    App(String),
    /// Unit-level bag; only that unit writes it
    Unit(UnitId),
}

impl fmt::Display for BagOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BagOwner::App(app) => f.write_str(app),
            BagOwner::Unit(unit) => write!(f, "{}", unit),
        }
    }
}

impl TryFrom<String> for BagOwner {
    type Error = OperatorError;

    fn try_from(value: String) -> Result<Self> {
        if value.contains('/') {
            Ok(BagOwner::Unit(value.parse()?))
        } else if value.is_empty() {
            Err(OperatorError::InvalidConfig("empty bag owner".to_string()))
        } else {
            Ok(BagOwner::App(value))
        }
    }
}

impl From<BagOwner> for String {
    fn from(owner: BagOwner) -> Self {
        owner.to_string()
    }
}

impl JsonSchema for BagOwner {
    fn schema_name() -> String {
        "BagOwner".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// A typed channel between this application and a peer or remote application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Relation {
    pub id: RelationId,
    pub interface: Interface,
    /// Remote application name; the local application for peer relations
    pub remote_app: String,
    /// Remote units (peers other than the local unit for peer relations)
    #[serde(default)]
    pub units: Vec<UnitId>,
    #[serde(default)]
    pub bags: BTreeMap<BagOwner, DataBag>,
}

impl Relation {
    pub fn new(id: RelationId, interface: Interface, remote_app: impl Into<String>) -> Self {
        Self {
            id,
            interface,
            remote_app: remote_app.into(),
            units: Vec::new(),
            bags: BTreeMap::new(),
        }
    }

    pub fn bag(&self, owner: &BagOwner) -> Option<&DataBag> {
        self.bags.get(owner)
    }

    /// Bag of the given application, empty if it has not published anything
    pub fn app_bag(&self, app: &str) -> DataBag {
        self.bags
            .get(&BagOwner::App(app.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn remote_app_bag(&self) -> DataBag {
        self.app_bag(&self.remote_app)
    }

    pub fn unit_bag(&self, unit: &UnitId) -> DataBag {
        self.bags
            .get(&BagOwner::Unit(unit.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a single key write; `None` deletes the key.
    pub fn set(&mut self, owner: BagOwner, key: &str, value: Option<String>) {
        let bag = self.bags.entry(owner).or_default();
        match value {
            Some(v) => {
                bag.insert(key.to_string(), v);
            }
            None => {
                bag.remove(key);
            }
        }
    }
}

/// All relations currently established for the application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RelationSet(pub Vec<Relation>);

impl RelationSet {
    pub fn get(&self, interface: Interface) -> Option<&Relation> {
        self.0.iter().find(|r| r.interface == interface)
    }

    pub fn by_id(&self, id: RelationId) -> Option<&Relation> {
        self.0.iter().find(|r| r.id == id)
    }

    pub fn by_id_mut(&mut self, id: RelationId) -> Option<&mut Relation> {
        self.0.iter_mut().find(|r| r.id == id)
    }

    pub fn all(&self, interface: Interface) -> impl Iterator<Item = &Relation> {
        self.0.iter().filter(move |r| r.interface == interface)
    }

    pub fn insert(&mut self, relation: Relation) {
        self.0.retain(|r| r.id != relation.id);
        self.0.push(relation);
        self.0.sort_by_key(|r| r.id);
    }

    pub fn remove(&mut self, id: RelationId) -> Option<Relation> {
        let pos = self.0.iter().position(|r| r.id == id)?;
        Some(self.0.remove(pos))
    }

    /// Enforce per-endpoint relation limits.
    pub fn validate_limits(&self) -> Result<()> {
        for interface in Interface::ALL {
            if let Some(limit) = interface.limit() {
                let count = self.all(interface).count();
                if count > limit {
                    return Err(OperatorError::InvalidConfig(format!(
                        "at most {} '{}' relation(s) allowed, found {}",
                        limit, interface, count
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_metadata() {
        assert_eq!(Interface::KafkaClient.endpoint(), "kafka-client");
        assert_eq!(Interface::from_endpoint("certificates"), Some(Interface::Certificates));
        assert_eq!(Interface::Restart.scope(), RelationScope::Peer);
        assert_eq!(Interface::Certificates.limit(), Some(1));
        assert_eq!(Interface::KafkaClient.limit(), None);
    }

    #[test]
    fn test_certificates_absent_is_valid() {
        let mut set = RelationSet::default();
        set.insert(Relation::new(1, Interface::Zookeeper, "zookeeper"));
        assert!(set.validate_limits().is_ok());
        assert!(set.get(Interface::Certificates).is_none());
    }

    #[test]
    fn test_second_certificates_relation_rejected() {
        let mut set = RelationSet::default();
        set.insert(Relation::new(1, Interface::Certificates, "tls-a"));
        set.insert(Relation::new(2, Interface::Certificates, "tls-b"));
        let err = set.validate_limits().unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_set_and_delete_keys() {
        let mut rel = Relation::new(3, Interface::Zookeeper, "zookeeper");
        let owner = BagOwner::App("kafka".into());
        rel.set(owner.clone(), "chroot", Some("/kafka".into()));
        assert_eq!(rel.app_bag("kafka").get("chroot").map(String::as_str), Some("/kafka"));
        rel.set(owner, "chroot", None);
        assert!(rel.app_bag("kafka").is_empty());
    }

    #[test]
    fn test_relation_json_shape() {
        let json = r#"{
            "id": 4,
            "interface": "kafka-client",
            "remote-app": "app",
            "bags": { "app": { "topic": "TOPIC" } }
        }"#;
        let rel: Relation = serde_json::from_str(json).unwrap();
        assert_eq!(rel.interface, Interface::KafkaClient);
        assert_eq!(rel.remote_app_bag().get("topic").map(String::as_str), Some("TOPIC"));
    }

    #[test]
    fn test_diff_bags() {
        let current: DataBag = [("a", "1"), ("b", "2")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let desired: DataBag = [("a", "1"), ("c", "3")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(
            diff_bags(&current, &desired),
            vec![("c".to_string(), Some("3".to_string())), ("b".to_string(), None)]
        );
        assert!(diff_bags(&desired, &desired).is_empty());
    }

    #[test]
    fn test_bag_owner_wire_names() {
        let unit: BagOwner = "kafka/1".to_string().try_into().unwrap();
        assert_eq!(unit, BagOwner::Unit(UnitId::new("kafka", 1)));
        let app: BagOwner = "zookeeper".to_string().try_into().unwrap();
        assert_eq!(app, BagOwner::App("zookeeper".into()));
    }
}
