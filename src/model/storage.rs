//! Storage declarations and attached volumes

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

pub const LOG_DATA: &str = "log-data";

/// Byte size written the way the runtime declares storage (`10G`, `512M`).
///
/// Suffixes are binary multiples: `M` = MiB, `G` = GiB, `T` = TiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize(pub u64);

const MIB: u64 = 1024 * 1024;

impl ByteSize {
    pub fn gib(n: u64) -> Self {
        ByteSize(n * 1024 * MIB)
    }

    pub fn mib(n: u64) -> Self {
        ByteSize(n * MIB)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (digits, multiplier) = match s.chars().last() {
            Some('M') | Some('m') => (&s[..s.len() - 1], MIB),
            Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * MIB),
            Some('T') | Some('t') => (&s[..s.len() - 1], 1024 * 1024 * MIB),
            Some(c) if c.is_ascii_digit() => (s, 1),
            _ => {
                return Err(OperatorError::InvalidConfig(format!(
                    "malformed size '{}'",
                    s
                )))
            }
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| OperatorError::InvalidConfig(format!("malformed size '{}'", s)))?;
        n.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| OperatorError::InvalidConfig(format!("size '{}' overflows", s)))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gib = 1024 * MIB;
        if self.0 >= gib && self.0 % gib == 0 {
            write!(f, "{}G", self.0 / gib)
        } else if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{}M", self.0 / MIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl TryFrom<String> for ByteSize {
    type Error = OperatorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

impl JsonSchema for ByteSize {
    fn schema_name() -> String {
        "ByteSize".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// Declared volume class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct StorageSpec {
    pub name: String,
    pub minimum_size: ByteSize,
    /// Mount root; every volume is mounted beneath it
    pub location: PathBuf,
    #[serde(default = "default_min_count")]
    pub min_count: u32,
    /// `None` means "or more"
    #[serde(default)]
    pub max_count: Option<u32>,
}

impl StorageSpec {
    /// The `log-data` class: filesystem, at least 10G, one or more volumes.
    pub fn log_data(location: impl Into<PathBuf>) -> Self {
        Self {
            name: LOG_DATA.to_string(),
            minimum_size: ByteSize::gib(10),
            location: location.into(),
            min_count: 1,
            max_count: None,
        }
    }

    /// Contradictory declarations halt reconciliation.
    pub fn validate(&self) -> Result<()> {
        if self.min_count == 0 {
            return Err(OperatorError::Fatal(format!(
                "storage '{}' must require at least one volume",
                self.name
            )));
        }
        if let Some(max) = self.max_count {
            if max < self.min_count {
                return Err(OperatorError::Fatal(format!(
                    "storage '{}' declares max count {} below min count {}",
                    self.name, max, self.min_count
                )));
            }
        }
        if self.minimum_size.bytes() == 0 {
            return Err(OperatorError::Fatal(format!(
                "storage '{}' declares a zero minimum size",
                self.name
            )));
        }
        if !self.location.is_absolute() {
            return Err(OperatorError::Fatal(format!(
                "storage '{}' mount root {} is not absolute",
                self.name,
                self.location.display()
            )));
        }
        Ok(())
    }
}

fn default_min_count() -> u32 {
    1
}

/// An attached filesystem volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Volume {
    /// Runtime storage id, e.g. `log-data/0`
    pub id: String,
    pub size: ByteSize,
    /// Mount point; derived from the storage root when absent
    #[serde(default)]
    pub location: Option<PathBuf>,
}

impl Volume {
    pub fn new(id: impl Into<String>, size: ByteSize) -> Self {
        Self {
            id: id.into(),
            size,
            location: None,
        }
    }

    /// Numeric suffix of the storage id (`log-data/3` → 3)
    pub fn ordinal(&self) -> Option<u32> {
        self.id.rsplit_once('/').and_then(|(_, n)| n.parse().ok())
    }

    pub fn mount_path(&self, root: &Path) -> PathBuf {
        match &self.location {
            Some(location) => location.clone(),
            None => {
                let leaf = self.id.replace('/', "-");
                root.join(leaf)
            }
        }
    }
}
