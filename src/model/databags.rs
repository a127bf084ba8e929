//! Typed schemas for relation data bags
//!
//! Bags arrive as string maps. Each interface gets an explicit schema here;
//! an empty bag means the other side has not published yet, while a bag with
//! missing or unknown keys is rejected as `InvalidConfig`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::model::relation::{DataBag, RelationId};

/// Decode a bag into its schema, mapping failures to `InvalidConfig`.
pub fn decode<T: DeserializeOwned>(what: &str, bag: &DataBag) -> Result<T> {
    let value = serde_json::to_value(bag)?;
    serde_json::from_value(value)
        .map_err(|e| OperatorError::InvalidConfig(format!("{} relation data: {}", what, e)))
}

/// Encode a schema value back into a flat string bag.
pub fn encode<T: Serialize>(value: &T) -> Result<DataBag> {
    let json = serde_json::to_value(value)?;
    let mut bag = DataBag::new();
    if let serde_json::Value::Object(map) = json {
        for (key, value) in map {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => {
                    bag.insert(key, s);
                }
                other => {
                    bag.insert(key, other.to_string());
                }
            }
        }
    }
    Ok(bag)
}

mod comma_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&items.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// `enabled` / `disabled` switch used by several interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TlsFlag {
    Enabled,
    #[default]
    Disabled,
}

impl TlsFlag {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            TlsFlag::Enabled
        } else {
            TlsFlag::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self == TlsFlag::Enabled
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsFlag::Enabled => "enabled",
            TlsFlag::Disabled => "disabled",
        }
    }
}

// ---------------------------------------------------------------------------
// zookeeper (requires)
// ---------------------------------------------------------------------------

/// Connection data published by the ZooKeeper application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ZookeeperData {
    pub chroot: String,
    pub username: String,
    pub password: String,
    #[serde(with = "comma_list")]
    #[schemars(with = "String")]
    pub endpoints: Vec<String>,
    #[serde(with = "comma_list")]
    #[schemars(with = "String")]
    pub uris: Vec<String>,
    pub tls: TlsFlag,
}

impl ZookeeperData {
    /// `Ok(None)` while ZooKeeper has not published credentials.
    pub fn from_bag(bag: &DataBag) -> Result<Option<Self>> {
        if bag.is_empty() {
            return Ok(None);
        }
        let data: Self = decode("zookeeper", bag)?;
        if !data.chroot.starts_with('/') {
            return Err(OperatorError::InvalidConfig(format!(
                "zookeeper chroot '{}' must start with '/'",
                data.chroot
            )));
        }
        if data.uris.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "zookeeper relation data has no uris".to_string(),
            ));
        }
        Ok(Some(data))
    }

    /// Connect string with the chroot appended once, e.g.
    /// `1.1.1.1:2181,2.2.2.2:2181/kafka`.
    pub fn connect_string(&self) -> String {
        let mut hosts: Vec<&str> = Vec::new();
        for uri in &self.uris {
            let host = uri.strip_suffix(self.chroot.as_str()).unwrap_or(uri);
            let host = host.trim_end_matches('/');
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        format!("{}{}", hosts.join(","), self.chroot)
    }
}

// ---------------------------------------------------------------------------
// certificates (requires, limit 1)
// ---------------------------------------------------------------------------

/// TLS material published by the certificate provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CertificatesData {
    pub certificate: String,
    pub ca: String,
    pub private_key: String,
    #[serde(default)]
    pub chain: Option<String>,
}

impl CertificatesData {
    pub fn from_bag(bag: &DataBag) -> Result<Option<Self>> {
        if bag.is_empty() {
            return Ok(None);
        }
        decode("certificates", bag).map(Some)
    }
}

// ---------------------------------------------------------------------------
// kafka-client (provides)
// ---------------------------------------------------------------------------

/// Role a client application asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Admin,
    Producer,
    Consumer,
}

mod role_list {
    use super::ClientRole;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        roles: &[ClientRole],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let names: Vec<&str> = roles
            .iter()
            .map(|r| match r {
                ClientRole::Admin => "admin",
                ClientRole::Producer => "producer",
                ClientRole::Consumer => "consumer",
            })
            .collect();
        serializer.serialize_str(&names.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ClientRole>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let mut roles = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let role = match name {
                "admin" => ClientRole::Admin,
                "producer" => ClientRole::Producer,
                "consumer" => ClientRole::Consumer,
                other => return Err(D::Error::custom(format!("unknown role '{}'", other))),
            };
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        roles.sort();
        Ok(roles)
    }
}

/// What a client application requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientRequest {
    pub topic: String,
    #[serde(with = "role_list")]
    #[schemars(with = "String")]
    pub extra_user_roles: Vec<ClientRole>,
    #[serde(default)]
    pub consumer_group_prefix: Option<String>,
}

impl ClientRequest {
    pub fn from_bag(bag: &DataBag) -> Result<Option<Self>> {
        if bag.is_empty() {
            return Ok(None);
        }
        decode("kafka-client", bag).map(Some)
    }

    pub fn is_admin(&self) -> bool {
        self.extra_user_roles.contains(&ClientRole::Admin)
    }
}

/// What the broker publishes back to a client application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientConnection {
    pub username: String,
    pub password: String,
    #[serde(with = "comma_list")]
    #[schemars(with = "String")]
    pub endpoints: Vec<String>,
    pub zookeeper_uris: String,
    pub consumer_group_prefix: String,
    pub tls: TlsFlag,
    /// Echo of the request this connection answers, as JSON
    pub data: String,
}

/// Username issued to the client on a given relation
pub fn client_username(relation_id: RelationId) -> String {
    format!("relation-{}", relation_id)
}

// ---------------------------------------------------------------------------
// cluster (peer)
// ---------------------------------------------------------------------------

pub const INTER_BROKER_USER: &str = "sync";
pub const ADMIN_USER: &str = "admin";
pub const INTERNAL_USERS: [&str; 2] = [INTER_BROKER_USER, ADMIN_USER];
const BROKER_CREDS_ADDED: &str = "added";

/// Key under which an internal user's password is kept
pub fn password_key(username: &str) -> String {
    format!("{}-password", username)
}

/// Application-level peer bag: shared secrets and client passwords
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAppData {
    pub internal_passwords: BTreeMap<String, String>,
    /// Internal SCRAM users have been registered with ZooKeeper
    pub broker_creds_added: bool,
    pub client_passwords: BTreeMap<RelationId, String>,
}

impl PeerAppData {
    pub fn from_bag(bag: &DataBag) -> Result<Self> {
        let mut data = PeerAppData::default();
        for (key, value) in bag {
            if let Some(user) = key.strip_suffix("-password") {
                if INTERNAL_USERS.contains(&user) {
                    if !value.is_empty() {
                        data.internal_passwords.insert(user.to_string(), value.clone());
                    }
                    continue;
                }
            }
            if key == "broker-creds" {
                data.broker_creds_added = value == BROKER_CREDS_ADDED;
                continue;
            }
            if let Some(id) = key.strip_prefix("relation-") {
                let id: RelationId = id.parse().map_err(|_| {
                    OperatorError::InvalidConfig(format!("malformed peer key '{}'", key))
                })?;
                if !value.is_empty() {
                    data.client_passwords.insert(id, value.clone());
                }
                continue;
            }
            return Err(OperatorError::InvalidConfig(format!(
                "unknown key '{}' in cluster application data",
                key
            )));
        }
        Ok(data)
    }

    pub fn password(&self, username: &str) -> Option<&str> {
        self.internal_passwords.get(username).map(String::as_str)
    }

    pub fn broker_creds_value() -> &'static str {
        BROKER_CREDS_ADDED
    }
}

/// Unit-level peer bag: addresses published by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PeerUnitData {
    #[serde(default)]
    pub private_address: Option<String>,
    #[serde(default)]
    pub ingress_address: Option<String>,
    #[serde(default)]
    pub egress_subnets: Option<String>,
}

impl PeerUnitData {
    pub fn from_bag(bag: &DataBag) -> Result<Self> {
        decode("cluster", bag)
    }
}
