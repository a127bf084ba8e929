//! Unit status and status-condition helpers
//!
//! The runtime shows one status line per unit; conditions keep the finer
//! grained history (ready, storage, rolling operation, degraded) with
//! transition times so that operators can tell when something changed.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, OperatorError};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Unit condition types
pub const UNIT_CONDITION_READY: &str = "Ready";
pub const UNIT_CONDITION_STORAGE_READY: &str = "StorageReady";
pub const UNIT_CONDITION_ROLLING: &str = "RollingOperation";
pub const UNIT_CONDITION_DEGRADED: &str = "Degraded";

/// Status line the runtime displays for a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    /// Workload running; the message carries warnings, if any
    Active(String),
    /// Waiting on another application or peer
    Waiting(String),
    /// Needs human intervention
    Blocked(String),
    /// Performing a disruptive step
    Maintenance(String),
    /// Last event failed; retried on the next event
    Error(String),
}

impl Default for UnitStatus {
    fn default() -> Self {
        UnitStatus::Maintenance("installing".to_string())
    }
}

impl UnitStatus {
    pub fn active() -> Self {
        UnitStatus::Active(String::new())
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Blocked(m)
            | UnitStatus::Maintenance(m)
            | UnitStatus::Error(m) => m,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, UnitStatus::Blocked(_))
    }

    /// Status for an error raised while reconciling
    pub fn from_error(err: &OperatorError) -> Self {
        let msg = err.status_message();
        match err.class() {
            ErrorClass::Retryable => UnitStatus::Waiting(msg),
            ErrorClass::Blocked | ErrorClass::Fatal => UnitStatus::Blocked(msg),
            ErrorClass::Degraded => UnitStatus::Active(format!("degraded: {}", msg)),
            ErrorClass::Internal => UnitStatus::Maintenance(msg),
        }
    }
}

/// One facet of a unit's health, with the time it last flipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct UnitCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Record the current value of condition `kind`. `since` only moves when
/// the status flips; returns whether it did.
pub fn record_condition(
    conditions: &mut Vec<UnitCondition>,
    kind: &str,
    holds: bool,
    reason: &str,
    now: DateTime<Utc>,
) -> bool {
    let status = if holds { CONDITION_TRUE } else { CONDITION_FALSE };
    match conditions.iter_mut().find(|c| c.kind == kind) {
        Some(existing) if existing.status == status => {
            existing.reason = reason.to_string();
            false
        }
        Some(existing) => {
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.since = now;
            true
        }
        None => {
            conditions.push(UnitCondition {
                kind: kind.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                since: now,
            });
            true
        }
    }
}

/// Status of condition `kind`, `Unknown` when never recorded
pub fn condition_status<'a>(conditions: &'a [UnitCondition], kind: &str) -> &'a str {
    conditions
        .iter()
        .find(|c| c.kind == kind)
        .map(|c| c.status.as_str())
        .unwrap_or(CONDITION_UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_condition_since_moves_only_on_flip() {
        let mut conditions = Vec::new();
        assert!(record_condition(&mut conditions, UNIT_CONDITION_ROLLING, false, "Idle", day(1)));
        assert!(!record_condition(&mut conditions, UNIT_CONDITION_ROLLING, false, "Idle", day(2)));
        assert_eq!(conditions[0].since, day(1));

        assert!(record_condition(
            &mut conditions,
            UNIT_CONDITION_ROLLING,
            true,
            "InProgress",
            day(3)
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].since, day(3));
        assert_eq!(conditions[0].reason, "InProgress");
        assert_eq!(condition_status(&conditions, UNIT_CONDITION_ROLLING), CONDITION_TRUE);
    }

    #[test]
    fn test_unrecorded_condition_is_unknown() {
        let mut conditions = Vec::new();
        record_condition(&mut conditions, UNIT_CONDITION_READY, true, "BrokerConfigured", day(1));
        assert_eq!(condition_status(&conditions, UNIT_CONDITION_READY), CONDITION_TRUE);
        assert_eq!(condition_status(&conditions, UNIT_CONDITION_DEGRADED), CONDITION_UNKNOWN);
    }

    #[test]
    fn test_status_from_error() {
        let missing = OperatorError::MissingDependency("zookeeper relation".into());
        let waiting = UnitStatus::from_error(&missing);
        assert_eq!(waiting, UnitStatus::Waiting("zookeeper relation".into()));

        let blocked = UnitStatus::from_error(&OperatorError::InvalidConfig("bad cert".into()));
        assert!(blocked.is_blocked());

        let degraded = UnitStatus::from_error(&OperatorError::PeerTimeout("kafka/2".into()));
        assert_eq!(degraded, UnitStatus::Active("degraded: kafka/2".into()));
    }
}
