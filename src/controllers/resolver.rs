//! Desired-State Resolver
//!
//! Computes the broker configuration a unit should be running from the
//! current relation data, charm config, peer membership and storage. The
//! resolver is pure: it reads its inputs and either returns a complete
//! [`DesiredConfig`] or the first reason it cannot, never a partial result.

use std::collections::BTreeMap;
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controllers::provider;
use crate::controllers::storage::{StorageManager, StorageState};
use crate::error::{OperatorError, Result};
use crate::model::config::CharmConfig;
use crate::model::databags::{
    client_username, CertificatesData, PeerAppData, PeerUnitData, ZookeeperData,
    ADMIN_USER, INTER_BROKER_USER,
};
use crate::model::relation::{Interface, RelationSet};
use crate::model::unit::UnitId;
use crate::settings::OperatorSettings;

pub const SCRAM_MECHANISM: &str = "SCRAM-SHA-512";

/// One listener the broker binds and advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Listener {
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

impl Listener {
    fn new(scope: &str, tls: bool, port: u16) -> Self {
        let protocol = if tls { "SASL_SSL" } else { "SASL_PLAINTEXT" };
        Self {
            name: format!("{}_{}", scope, protocol),
            protocol: protocol.to_string(),
            port,
        }
    }

    pub fn bind(&self) -> String {
        format!("{}://0.0.0.0:{}", self.name, self.port)
    }

    pub fn advertised(&self, host: &str) -> String {
        format!("{}://{}:{}", self.name, host, self.port)
    }
}

/// PEM material handed over by the certificate provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct TlsMaterial {
    pub certificate: String,
    pub ca: String,
    pub private_key: String,
    pub chain: Option<String>,
    pub keystore_path: PathBuf,
    pub truststore_path: PathBuf,
}

/// Partition and replica defaults scaled to the cluster size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicationDefaults {
    pub num_partitions: u32,
    pub replication_factor: u32,
    pub min_insync_replicas: u32,
}

impl ReplicationDefaults {
    pub fn for_cluster_size(units: usize) -> Self {
        if units < 3 {
            Self {
                num_partitions: 1,
                replication_factor: 1,
                min_insync_replicas: 1,
            }
        } else {
            Self {
                num_partitions: 3,
                replication_factor: 3,
                min_insync_replicas: 2,
            }
        }
    }
}

/// Target broker configuration for one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct DesiredConfig {
    pub broker_id: u32,
    pub host: String,
    pub listeners: Vec<Listener>,
    pub zookeeper_connect: String,
    pub tls: Option<TlsMaterial>,
    pub log_dirs: Vec<PathBuf>,
    pub super_users: Vec<String>,
    pub replication: ReplicationDefaults,
    pub server_properties: BTreeMap<String, String>,
    pub client_properties: BTreeMap<String, String>,
    pub jaas: String,
    pub kafka_opts: String,
}

impl DesiredConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Properties that reference TLS material, withheld from credential output
    pub fn is_tls_property(key: &str) -> bool {
        key.starts_with("ssl.")
    }
}

/// Everything the resolver reads
#[derive(Debug, Clone, Copy)]
pub struct ResolverInput<'a> {
    pub unit: &'a UnitId,
    pub config: &'a CharmConfig,
    pub relations: &'a RelationSet,
    /// All members of the peer cluster, including this unit
    pub members: &'a [UnitId],
    pub storage: &'a StorageState,
}

#[derive(Debug, Clone)]
pub struct Resolver {
    settings: OperatorSettings,
    storage: StorageManager,
}

impl Resolver {
    pub fn new(settings: OperatorSettings) -> Result<Self> {
        let storage = StorageManager::new(settings.storage_spec())?;
        Ok(Self { settings, storage })
    }

    pub fn settings(&self) -> &OperatorSettings {
        &self.settings
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn resolve(&self, input: &ResolverInput<'_>) -> Result<DesiredConfig> {
        input.relations.validate_limits()?;
        input.config.validate()?;

        let zookeeper = self.zookeeper(input.relations)?;

        let cluster = input
            .relations
            .get(Interface::Cluster)
            .ok_or_else(|| {
                OperatorError::MissingDependency("waiting for peer relation".to_string())
            })?;
        let host = PeerUnitData::from_bag(&cluster.unit_bag(input.unit))?
            .private_address
            .ok_or_else(|| {
                OperatorError::MissingDependency("waiting for unit private address".to_string())
            })?;

        let peer_app = PeerAppData::from_bag(&cluster.app_bag(&self.settings.app_name))?;
        let no_credentials =
            || OperatorError::MissingDependency("waiting for internal credentials".to_string());
        let sync_password = peer_app
            .password(INTER_BROKER_USER)
            .ok_or_else(no_credentials)?;
        let admin_password = peer_app.password(ADMIN_USER).ok_or_else(no_credentials)?;

        let tls = self.tls(input.relations)?;
        if tls.is_some() != zookeeper.tls.is_enabled() {
            return Err(OperatorError::InvalidConfig(
                "TLS must be enabled for Zookeeper and Kafka".to_string(),
            ));
        }

        self.storage.readiness(input.storage)?;
        let log_dirs = self.storage.mount_paths(input.storage);

        let ports = self.settings.ports;
        let tls_on = tls.is_some();
        let internal_port = if tls_on { ports.internal_tls } else { ports.internal };
        let mut listeners = vec![
            Listener::new("INTERNAL", tls_on, internal_port),
            Listener::new("CLIENT", false, ports.client),
        ];
        if tls_on {
            listeners.push(Listener::new("CLIENT", true, ports.client_tls));
        }

        let replication = ReplicationDefaults::for_cluster_size(input.members.len().max(1));
        let super_users = super_users(input.relations, &peer_app);

        let jaas = zookeeper_jaas(&zookeeper.username, &zookeeper.password);
        let kafka_opts = format!(
            "-Djava.security.auth.login.config={}",
            self.settings.jaas_path().display()
        );

        let mut desired = DesiredConfig {
            broker_id: input.unit.index(),
            host,
            listeners,
            zookeeper_connect: zookeeper.connect_string(),
            tls,
            log_dirs,
            super_users,
            replication,
            server_properties: BTreeMap::new(),
            client_properties: BTreeMap::new(),
            jaas,
            kafka_opts,
        };
        desired.server_properties = server_properties(&desired, input.config, sync_password);
        desired.client_properties = client_properties(&desired, admin_password);
        Ok(desired)
    }

    fn zookeeper(&self, relations: &RelationSet) -> Result<ZookeeperData> {
        let relation = relations.get(Interface::Zookeeper).ok_or_else(|| {
            OperatorError::MissingDependency("waiting for zookeeper relation".to_string())
        })?;
        ZookeeperData::from_bag(&relation.remote_app_bag())?.ok_or_else(|| {
            OperatorError::MissingDependency("waiting for zookeeper credentials".to_string())
        })
    }

    fn tls(&self, relations: &RelationSet) -> Result<Option<TlsMaterial>> {
        let relation = match relations.get(Interface::Certificates) {
            Some(relation) => relation,
            None => return Ok(None),
        };
        let data = CertificatesData::from_bag(&relation.remote_app_bag())?.ok_or_else(|| {
            OperatorError::MissingDependency("waiting for certificates".to_string())
        })?;

        check_certificates("certificate", &data.certificate)?;
        check_certificates("ca", &data.ca)?;
        if let Some(chain) = &data.chain {
            check_certificates("chain", chain)?;
        }
        check_private_key(&data.private_key)?;

        Ok(Some(TlsMaterial {
            certificate: data.certificate,
            ca: data.ca,
            private_key: data.private_key,
            chain: data.chain,
            keystore_path: self.settings.keystore_path(),
            truststore_path: self.settings.truststore_path(),
        }))
    }
}

fn check_certificates(field: &str, pem: &str) -> Result<()> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| OperatorError::InvalidConfig(format!("malformed {} PEM: {}", field, e)))?;
    if certs.is_empty() {
        return Err(OperatorError::InvalidConfig(format!(
            "{} contains no PEM certificate",
            field
        )));
    }
    Ok(())
}

fn check_private_key(pem: &str) -> Result<()> {
    let mut reader = pem.as_bytes();
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(OperatorError::InvalidConfig(
            "private-key contains no PEM private key".to_string(),
        )),
        Err(e) => Err(OperatorError::InvalidConfig(format!(
            "malformed private-key PEM: {}",
            e
        ))),
    }
}

/// Internal users plus admin-role clients that have been issued a password
fn super_users(relations: &RelationSet, peer_app: &PeerAppData) -> Vec<String> {
    let mut users = vec![
        format!("User:{}", INTER_BROKER_USER),
        format!("User:{}", ADMIN_USER),
    ];
    for (relation, request) in provider::client_requests(relations) {
        if request.is_admin() && peer_app.client_passwords.contains_key(&relation.id) {
            users.push(format!("User:{}", client_username(relation.id)));
        }
    }
    users
}

fn scram_jaas(username: &str, password: &str) -> String {
    format!(
        "org.apache.kafka.common.security.scram.ScramLoginModule required username=\"{}\" password=\"{}\";",
        username, password
    )
}

fn zookeeper_jaas(username: &str, password: &str) -> String {
    format!(
        "Client {{\n    org.apache.zookeeper.server.auth.DigestLoginModule required\n    username=\"{}\"\n    password=\"{}\";\n}};\n",
        username, password
    )
}

fn server_properties(
    desired: &DesiredConfig,
    config: &CharmConfig,
    sync_password: &str,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    let mut set = |k: &str, v: String| {
        props.insert(k.to_string(), v);
    };

    set("broker.id", desired.broker_id.to_string());
    set("zookeeper.connect", desired.zookeeper_connect.clone());
    set(
        "log.dirs",
        desired
            .log_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(","),
    );

    let internal = &desired.listeners[0];
    set(
        "listeners",
        desired.listeners.iter().map(Listener::bind).collect::<Vec<_>>().join(","),
    );
    set(
        "advertised.listeners",
        desired
            .listeners
            .iter()
            .map(|l| l.advertised(&desired.host))
            .collect::<Vec<_>>()
            .join(","),
    );
    set(
        "listener.security.protocol.map",
        desired
            .listeners
            .iter()
            .map(|l| format!("{}:{}", l.name, l.protocol))
            .collect::<Vec<_>>()
            .join(","),
    );
    set("inter.broker.listener.name", internal.name.clone());
    set("sasl.enabled.mechanisms", SCRAM_MECHANISM.to_string());
    set("sasl.mechanism.inter.broker.protocol", SCRAM_MECHANISM.to_string());
    for listener in &desired.listeners {
        set(
            &format!(
                "listener.name.{}.scram-sha-512.sasl.jaas.config",
                listener.name.to_lowercase()
            ),
            scram_jaas(INTER_BROKER_USER, sync_password),
        );
    }

    set("authorizer.class.name", "kafka.security.authorizer.AclAuthorizer".to_string());
    set("allow.everyone.if.no.acl.found", "false".to_string());
    set("super.users", desired.super_users.join(";"));
    set("zookeeper.set.acl", "true".to_string());

    set("num.partitions", desired.replication.num_partitions.to_string());
    set(
        "default.replication.factor",
        desired.replication.replication_factor.to_string(),
    );
    set(
        "min.insync.replicas",
        desired.replication.min_insync_replicas.to_string(),
    );
    set(
        "offsets.topic.replication.factor",
        desired.replication.replication_factor.to_string(),
    );
    set(
        "transaction.state.log.replication.factor",
        desired.replication.replication_factor.to_string(),
    );

    for (key, value) in config.broker_properties() {
        set(&key, value);
    }

    if let Some(tls) = &desired.tls {
        set("ssl.keystore.type", "PEM".to_string());
        set("ssl.keystore.location", tls.keystore_path.display().to_string());
        set("ssl.truststore.type", "PEM".to_string());
        set("ssl.truststore.location", tls.truststore_path.display().to_string());
        set("ssl.client.auth", "none".to_string());
        set("zookeeper.ssl.client.enable", "true".to_string());
        set(
            "zookeeper.clientCnxnSocket",
            "org.apache.zookeeper.ClientCnxnSocketNetty".to_string(),
        );
        set("zookeeper.ssl.truststore.type", "PEM".to_string());
        set(
            "zookeeper.ssl.truststore.location",
            tls.truststore_path.display().to_string(),
        );
    }

    props
}

fn client_properties(desired: &DesiredConfig, admin_password: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    let client = desired
        .listeners
        .iter()
        .rev()
        .find(|l| l.name.starts_with("CLIENT"));
    if let Some(listener) = client {
        props.insert("security.protocol".to_string(), listener.protocol.clone());
        props.insert(
            "bootstrap.servers".to_string(),
            format!("{}:{}", desired.host, listener.port),
        );
    }
    props.insert("sasl.mechanism".to_string(), SCRAM_MECHANISM.to_string());
    props.insert("sasl.jaas.config".to_string(), scram_jaas(ADMIN_USER, admin_password));
    if let Some(tls) = &desired.tls {
        props.insert("ssl.truststore.type".to_string(), "PEM".to_string());
        props.insert(
            "ssl.truststore.location".to_string(),
            tls.truststore_path.display().to_string(),
        );
    }
    props
}
