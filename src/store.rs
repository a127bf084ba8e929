//! Versioned key-value records
//!
//! Everything the operator keeps between invocations (last applied config,
//! unit state, mirrored relation bags) goes through [`Store`]. Records carry a
//! version that increments on every write; writers pass the version they read
//! and lose with [`OperatorError::StoreConflict`] if someone else got there
//! first.
//!
//! Implementations:
//! - [`MemoryStore`]: tests and simulations, cheap to clone and share
//! - [`FileStore`]: a single JSON document on disk, replaced atomically

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OperatorError, Result};
use crate::model::relation::{BagOwner, RelationId};
use crate::model::unit::UnitId;

/// Owner of a group of records
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Private state of one unit
    Unit(UnitId),
    /// Mirror of one relation data bag
    RelationBag {
        relation_id: RelationId,
        owner: BagOwner,
    },
}

impl Scope {
    fn prefix(&self) -> String {
        match self {
            Scope::Unit(unit) => format!("unit:{}:", unit),
            Scope::RelationBag { relation_id, owner } => {
                format!("relation:{}:{}:", relation_id, owner)
            }
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }
}

/// A stored value and its version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub version: u64,
    pub value: serde_json::Value,
}

/// Persistence seam for the engine and coordinator
pub trait Store: Send + Sync {
    fn get(&self, scope: &Scope, key: &str) -> Result<Option<Record>>;

    /// Write `value`. `expected_version` of `None` writes unconditionally,
    /// `Some(0)` requires the key to be absent, `Some(v)` requires version `v`.
    /// Returns the new version.
    fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64>;

    fn delete(&self, scope: &Scope, key: &str) -> Result<()>;

    /// All records under a scope, sorted by key
    fn entries(&self, scope: &Scope) -> Result<Vec<(String, Record)>>;
}

/// Load and decode a typed record.
pub fn load<T: DeserializeOwned>(
    store: &dyn Store,
    scope: &Scope,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(scope, key)? {
        Some(record) => {
            let value = serde_json::from_value(record.value)?;
            Ok(Some((value, record.version)))
        }
        None => Ok(None),
    }
}

/// Encode and write a typed record with compare-and-set.
pub fn save<T: Serialize>(
    store: &dyn Store,
    scope: &Scope,
    key: &str,
    value: &T,
    expected_version: Option<u64>,
) -> Result<u64> {
    store.put(scope, key, serde_json::to_value(value)?, expected_version)
}

type Records = BTreeMap<String, Record>;

fn check_version(records: &Records, full_key: &str, expected: Option<u64>) -> Result<u64> {
    let found = records.get(full_key).map(|r| r.version).unwrap_or(0);
    if let Some(expected) = expected {
        if expected != found {
            return Err(OperatorError::StoreConflict {
                key: full_key.to_string(),
                expected,
                found,
            });
        }
    }
    Ok(found + 1)
}

fn scoped_entries(records: &Records, scope: &Scope) -> Vec<(String, Record)> {
    let prefix = scope.prefix();
    records
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, r)| (k[prefix.len()..].to_string(), r.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Shared in-memory store; clones see the same records
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| OperatorError::Store("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn get(&self, scope: &Scope, key: &str) -> Result<Option<Record>> {
        Ok(self.lock()?.get(&scope.key(key)).cloned())
    }

    fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut records = self.lock()?;
        let full_key = scope.key(key);
        let version = check_version(&records, &full_key, expected_version)?;
        records.insert(full_key, Record { version, value });
        Ok(version)
    }

    fn delete(&self, scope: &Scope, key: &str) -> Result<()> {
        self.lock()?.remove(&scope.key(key));
        Ok(())
    }

    fn entries(&self, scope: &Scope) -> Result<Vec<(String, Record)>> {
        let records = self.lock()?;
        Ok(scoped_entries(&records, scope))
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// JSON document on disk. Each write replaces the file through a sibling
/// temporary file and a rename, so readers never see a torn document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Records> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Records::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Records::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, records: &Records) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = records.len(), "Wrote state file");
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| OperatorError::Store("file store lock poisoned".to_string()))
    }
}

impl Store for FileStore {
    fn get(&self, scope: &Scope, key: &str) -> Result<Option<Record>> {
        let _guard = self.guard()?;
        Ok(self.read()?.get(&scope.key(key)).cloned())
    }

    fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let _guard = self.guard()?;
        let mut records = self.read()?;
        let full_key = scope.key(key);
        let version = check_version(&records, &full_key, expected_version)?;
        records.insert(full_key, Record { version, value });
        self.write(&records)?;
        Ok(version)
    }

    fn delete(&self, scope: &Scope, key: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut records = self.read()?;
        if records.remove(&scope.key(key)).is_some() {
            self.write(&records)?;
        }
        Ok(())
    }

    fn entries(&self, scope: &Scope) -> Result<Vec<(String, Record)>> {
        let _guard = self.guard()?;
        Ok(scoped_entries(&self.read()?, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit_scope(n: u32) -> Scope {
        Scope::Unit(UnitId::new("kafka", n))
    }

    fn exercise(store: &dyn Store) {
        let scope = unit_scope(0);
        assert!(store.get(&scope, "state").unwrap().is_none());

        let v1 = store.put(&scope, "state", json!({"phase": "active"}), Some(0)).unwrap();
        assert_eq!(v1, 1);

        let err = store.put(&scope, "state", json!({}), Some(0)).unwrap_err();
        assert!(matches!(err, OperatorError::StoreConflict { expected: 0, found: 1, .. }));

        let v2 = store.put(&scope, "state", json!({"phase": "degraded"}), Some(1)).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.get(&scope, "state").unwrap().unwrap().value["phase"], "degraded");

        store.put(&unit_scope(1), "state", json!(1), None).unwrap();
        store.put(&scope, "other", json!(2), None).unwrap();
        let keys: Vec<String> = store
            .entries(&scope)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["other", "state"]);

        store.delete(&scope, "state").unwrap();
        assert!(store.get(&scope, "state").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_cas() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_file_store_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested/state.json")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileStore::open(&path).unwrap();
            save(&store, &unit_scope(2), "applied", &vec!["a", "b"], None).unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        let (value, version): (Vec<String>, u64) =
            load(&store, &unit_scope(2), "applied").unwrap().unwrap();
        assert_eq!(value, vec!["a", "b"]);
        assert_eq!(version, 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_relation_scopes_are_disjoint() {
        let store = MemoryStore::new();
        let a = Scope::RelationBag {
            relation_id: 1,
            owner: BagOwner::Unit(UnitId::new("kafka", 0)),
        };
        let b = Scope::RelationBag {
            relation_id: 1,
            owner: BagOwner::Unit(UnitId::new("kafka", 1)),
        };
        store.put(&a, "rolling-op", json!("x"), None).unwrap();
        assert!(store.get(&b, "rolling-op").unwrap().is_none());
        assert_eq!(store.entries(&a).unwrap().len(), 1);
    }
}
