//! Broker configuration options exposed to the operator's users
//!
//! Keys follow the runtime's kebab-case convention. Every option has a
//! default so an empty config is valid.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

/// User-facing configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CharmConfig {
    /// Retention time in milliseconds (-1 for unlimited); overrides hours when set
    #[serde(default = "default_log_retention_ms")]
    pub log_retention_ms: i64,

    /// Retention time in hours
    #[serde(default = "default_log_retention_hours")]
    pub log_retention_hours: i64,

    /// How long committed offsets are kept after a group empties
    #[serde(default = "default_offsets_retention_minutes")]
    pub offsets_retention_minutes: i64,

    /// Allow clients to create topics implicitly
    #[serde(default)]
    pub auto_create_topics: bool,

    /// Topic compression codec
    #[serde(default)]
    pub compression_type: CompressionType,

    /// Size of a single log segment file
    #[serde(default = "default_log_segment_bytes")]
    pub log_segment_bytes: i64,

    /// Largest record batch the broker accepts
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: i64,

    /// Threads handling network requests
    #[serde(default = "default_num_network_threads")]
    pub num_network_threads: i64,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            log_retention_ms: default_log_retention_ms(),
            log_retention_hours: default_log_retention_hours(),
            offsets_retention_minutes: default_offsets_retention_minutes(),
            auto_create_topics: false,
            compression_type: CompressionType::default(),
            log_segment_bytes: default_log_segment_bytes(),
            message_max_bytes: default_message_max_bytes(),
            num_network_threads: default_num_network_threads(),
        }
    }
}

/// Compression codec accepted by `compression.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    Snappy,
    Lz4,
    Zstd,
    Uncompressed,
    #[default]
    Producer,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
            CompressionType::Uncompressed => "uncompressed",
            CompressionType::Producer => "producer",
        }
    }
}

impl CharmConfig {
    /// Reject values the broker would refuse to start with.
    pub fn validate(&self) -> Result<()> {
        if self.log_retention_ms < -1 {
            return Err(invalid("log-retention-ms", "must be -1 or greater"));
        }
        if self.log_retention_hours < 1 {
            return Err(invalid("log-retention-hours", "must be at least 1"));
        }
        if self.offsets_retention_minutes < 1 {
            return Err(invalid("offsets-retention-minutes", "must be at least 1"));
        }
        // 14 bytes is the smallest segment the broker accepts
        if self.log_segment_bytes < 14 {
            return Err(invalid("log-segment-bytes", "must be at least 14"));
        }
        if self.message_max_bytes < 0 {
            return Err(invalid("message-max-bytes", "must not be negative"));
        }
        if self.num_network_threads < 1 {
            return Err(invalid("num-network-threads", "must be at least 1"));
        }
        Ok(())
    }

    /// Broker properties derived from the options
    pub fn broker_properties(&self) -> Vec<(String, String)> {
        let mut props = vec![
            (
                "log.retention.hours".to_string(),
                self.log_retention_hours.to_string(),
            ),
            (
                "offsets.retention.minutes".to_string(),
                self.offsets_retention_minutes.to_string(),
            ),
            (
                "auto.create.topics.enable".to_string(),
                self.auto_create_topics.to_string(),
            ),
            (
                "compression.type".to_string(),
                self.compression_type.as_str().to_string(),
            ),
            (
                "log.segment.bytes".to_string(),
                self.log_segment_bytes.to_string(),
            ),
            (
                "message.max.bytes".to_string(),
                self.message_max_bytes.to_string(),
            ),
            (
                "num.network.threads".to_string(),
                self.num_network_threads.to_string(),
            ),
        ];
        if self.log_retention_ms != default_log_retention_ms() {
            props.push((
                "log.retention.ms".to_string(),
                self.log_retention_ms.to_string(),
            ));
        }
        props
    }
}

fn invalid(option: &str, reason: &str) -> OperatorError {
    OperatorError::InvalidConfig(format!("config option '{}' {}", option, reason))
}

// Default value functions
fn default_log_retention_ms() -> i64 {
    -1
}

fn default_log_retention_hours() -> i64 {
    168
}

fn default_offsets_retention_minutes() -> i64 {
    10080
}

fn default_log_segment_bytes() -> i64 {
    1_073_741_824
}

fn default_message_max_bytes() -> i64 {
    1_048_588
}

fn default_num_network_threads() -> i64 {
    3
}
