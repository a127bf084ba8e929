//! Reconciliation controllers
//!
//! - [`resolver`]: relation data, config and storage to [`resolver::DesiredConfig`]
//! - [`render`]: desired config to workload files and restart classification
//! - [`rolling`]: peer-mediated serialization of disruptive operations
//! - [`storage`]: `log-data` volume tracking
//! - [`provider`], [`observability`]: bags published to related applications
//! - [`engine`]: the per-event reducer tying them together

pub mod engine;
pub mod observability;
pub mod provider;
pub mod render;
pub mod resolver;
pub mod rolling;
pub mod state;
pub mod storage;

pub use engine::{Engine, RandomSecrets, SecretSource};
pub use resolver::{DesiredConfig, Resolver};
pub use rolling::{Coordinator, OperationKind, OperationScope};
pub use state::{Action, Event, Phase, Snapshot, Transition, UnitState};
pub use storage::StorageManager;
