//! Key-value store abstraction
//!
//! Keys are ordered sequences of strings. Only per-key atomicity is assumed;
//! the conditional put is the one compare-and-set primitive callers rely on.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::AppError;

/// Hierarchical key, e.g. `["followers", "https://remote/follows/1"]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KvKey(Vec<String>);

impl KvKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Segment-wise prefix test. `["follow"]` is not a prefix of `["followers"]`.
    pub fn starts_with(&self, prefix: &KvKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// One entry returned by [`KvStore::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: KvKey,
    pub value: Value,
}

/// Durable key-value collaborator
///
/// Implemented once per deployment target. All components share one
/// instance behind an `Arc<dyn KvStore>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, AppError>;

    async fn set(&self, key: &KvKey, value: Value) -> Result<(), AppError>;

    /// Write `value` only if `key` is absent.
    ///
    /// Returns `true` when this call performed the write.
    async fn set_if_absent(&self, key: &KvKey, value: Value) -> Result<bool, AppError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &KvKey) -> Result<(), AppError>;

    /// Snapshot of every entry whose key starts with `prefix`
    async fn list(&self, prefix: &KvKey) -> Result<Vec<KvEntry>, AppError>;
}

/// Volatile store backed by a `BTreeMap`
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<KvKey, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, AppError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &KvKey, value: Value) -> Result<(), AppError> {
        self.entries.write().await.insert(key.clone(), value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &KvKey, value: Value) -> Result<bool, AppError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), value);
        Ok(true)
    }

    async fn delete(&self, key: &KvKey) -> Result<(), AppError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &KvKey) -> Result<Vec<KvEntry>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}
