//! Leader election policy
//!
//! The runtime normally tells each unit whether it leads. When it does not
//! (for example when the operator is driven from a bare bundle), the member
//! with the lowest index leads. Health does not enter the decision, so every
//! unit reaches the same answer from the same member list.

use tracing::debug;

use crate::controllers::state::Snapshot;
use crate::model::unit::UnitId;

/// Where a leadership decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderSource {
    Runtime,
    LowestIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leadership {
    pub is_leader: bool,
    /// The elected unit, when the operator made the decision itself
    pub leader: Option<UnitId>,
    pub source: LeaderSource,
}

/// Decide whether `snapshot.unit` leads.
pub fn elect(snapshot: &Snapshot) -> Leadership {
    if let Some(flag) = snapshot.leader {
        return Leadership {
            is_leader: flag,
            leader: None,
            source: LeaderSource::Runtime,
        };
    }

    // members() is sorted and always contains the local unit
    let leader = snapshot
        .members()
        .into_iter()
        .next()
        .unwrap_or_else(|| snapshot.unit.clone());
    debug!(unit = %snapshot.unit, leader = %leader, "Elected leader");

    Leadership {
        is_leader: leader == snapshot.unit,
        leader: Some(leader),
        source: LeaderSource::LowestIndex,
    }
}
