//! Unit identities and observed peer health

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::OperatorError;

/// Identity of one running instance, written `<app>/<index>`.
///
/// Units order by application name, then numerically by index, so
/// `kafka/2` sorts before `kafka/10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId {
    app: String,
    index: u32,
}

impl UnitId {
    pub fn new(app: impl Into<String>, index: u32) -> Self {
        Self {
            app: app.into(),
            index,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Ord for UnitId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.app
            .cmp(&other.app)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for UnitId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.index)
    }
}

impl FromStr for UnitId {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, index) = s
            .rsplit_once('/')
            .ok_or_else(|| OperatorError::InvalidConfig(format!("malformed unit name '{}'", s)))?;
        if app.is_empty() {
            return Err(OperatorError::InvalidConfig(format!(
                "malformed unit name '{}'",
                s
            )));
        }
        let index = index
            .parse::<u32>()
            .map_err(|_| OperatorError::InvalidConfig(format!("malformed unit index in '{}'", s)))?;
        Ok(Self::new(app, index))
    }
}

impl TryFrom<String> for UnitId {
    type Error = OperatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.to_string()
    }
}

impl JsonSchema for UnitId {
    fn schema_name() -> String {
        "UnitId".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// Health of a unit as observed by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum UnitHealth {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A member of the peer cluster, including the local unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct PeerUnit {
    pub id: UnitId,
    #[serde(default)]
    pub health: UnitHealth,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerUnit {
    pub fn healthy(id: UnitId) -> Self {
        Self {
            id,
            health: UnitHealth::Healthy,
            last_seen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_and_display() {
        let id: UnitId = "kafka/3".parse().unwrap();
        assert_eq!(id.app(), "kafka");
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "kafka/3");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("kafka".parse::<UnitId>().is_err());
        assert!("kafka/x".parse::<UnitId>().is_err());
        assert!("/0".parse::<UnitId>().is_err());
    }

    #[test]
    fn test_numeric_ordering() {
        let mut ids: Vec<UnitId> = ["kafka/10", "kafka/2", "kafka/0"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let names: Vec<String> = ids.iter().map(|u| u.to_string()).collect();
        assert_eq!(names, vec!["kafka/0", "kafka/2", "kafka/10"]);
    }

    #[test]
    fn test_unit_id_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(UnitId::new("kafka", 1), "a");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"kafka/1":"a"}"#);
        let back: BTreeMap<UnitId, String> = serde_json::from_str(&json).unwrap();
        assert!(back.contains_key(&UnitId::new("kafka", 1)));
    }
}
