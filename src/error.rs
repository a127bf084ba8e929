//! Error types for the Kafka operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// A required relation, credential or peer fact is not available yet
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Relation data, config or storage that needs operator correction
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two units raced for the same rolling operation id
    #[error("peer protocol conflict: {0}")]
    PeerProtocolConflict(String),

    /// A peer did not acknowledge a rolling operation in time
    #[error("peer timeout: {0}")]
    PeerTimeout(String),

    /// Contradictory declarations; reconciliation halts until corrected
    #[error("fatal misconfiguration: {0}")]
    Fatal(String),

    /// Persisted store error
    #[error("store error: {0}")]
    Store(String),

    /// Compare-and-set on a store record lost against a concurrent writer
    #[error("store conflict on {key}: expected version {expected}, found {found}")]
    StoreConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// Workload (broker service) control failed
    #[error("workload error: {0}")]
    Workload(String),

    /// Operator settings could not be loaded
    #[error("settings error: {0}")]
    Settings(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an error is surfaced to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wait for the next triggering event
    Retryable,
    /// Needs operator correction
    Blocked,
    /// Cluster keeps running with reduced redundancy
    Degraded,
    /// Resolved automatically, never shown to users
    Internal,
    /// Halts reconciliation for this unit
    Fatal,
}

impl OperatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::MissingDependency(_) => ErrorClass::Retryable,
            OperatorError::InvalidConfig(_) => ErrorClass::Blocked,
            OperatorError::PeerProtocolConflict(_) => ErrorClass::Internal,
            OperatorError::PeerTimeout(_) => ErrorClass::Degraded,
            OperatorError::Fatal(_) => ErrorClass::Fatal,
            OperatorError::StoreConflict { .. } => ErrorClass::Retryable,
            OperatorError::Store(_)
            | OperatorError::Workload(_)
            | OperatorError::Settings(_)
            | OperatorError::Serialization(_)
            | OperatorError::Io(_) => ErrorClass::Blocked,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// The bare message, without the variant prefix, for unit status lines
    pub fn status_message(&self) -> String {
        match self {
            OperatorError::MissingDependency(msg)
            | OperatorError::InvalidConfig(msg)
            | OperatorError::PeerProtocolConflict(msg)
            | OperatorError::PeerTimeout(msg)
            | OperatorError::Fatal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for OperatorError {
    fn from(err: toml::de::Error) -> Self {
        OperatorError::Settings(err.to_string())
    }
}
