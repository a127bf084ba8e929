//! Kafka broker operator
//!
//! Reconciliation core for a fleet of Kafka broker units. Each unit runs the
//! operator once per runtime event; the operator reads the unit's view of its
//! relations, configuration and storage, converges the broker towards the
//! resulting desired configuration, and coordinates disruptive restarts with
//! its peers so that at most one broker restarts at a time.
//!
//! ## Relations
//!
//! - `cluster`, `restart`: peer relations (shared secrets, rolling operations)
//! - `zookeeper`: required coordination service
//! - `certificates`: optional TLS material
//! - `kafka-client`, `metrics-endpoint`, `grafana-dashboard`: provided
//!
//! ## Example
//!
//! ```json
//! {
//!   "snapshot": { "unit": "kafka/0", "leader": true, "now": "2024-01-01T00:00:00Z" },
//!   "events": [{ "kind": "install" }]
//! }
//! ```

pub mod conditions;
pub mod controllers;
pub mod dispatch;
pub mod error;
pub mod leader_election;
pub mod model;
pub mod settings;
pub mod store;
pub mod testing;
pub mod workload;

pub use controllers::{Engine, Event, Snapshot, UnitState};
pub use dispatch::{Bundle, Dispatcher, InvocationReport};
pub use error::{OperatorError, Result};
pub use settings::OperatorSettings;
pub use store::{FileStore, MemoryStore, Store};
pub use workload::{SnapWorkload, Workload};
