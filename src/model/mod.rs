//! Typed model of units, relations, storage and configuration

pub mod config;
pub mod databags;
pub mod relation;
pub mod storage;
pub mod unit;

pub use config::{CharmConfig, CompressionType};
pub use databags::{
    CertificatesData, ClientConnection, ClientRequest, ClientRole, PeerAppData, PeerUnitData,
    TlsFlag, ZookeeperData,
};
pub use relation::{BagOwner, DataBag, Interface, Relation, RelationId, RelationScope, RelationSet};
pub use storage::{ByteSize, StorageSpec, Volume, LOG_DATA};
pub use unit::{PeerUnit, UnitHealth, UnitId};
