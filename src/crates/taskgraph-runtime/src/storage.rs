//! Abstract key/value and tabular storage contracts.
//!
//! The runtime treats these as opaque interfaces — concrete backends
//! (in-memory, file, SQLite, a remote KV service) are interchangeable as
//! long as they honour the contract. Only the in-memory reference
//! implementations live in this crate; anything durable is an external
//! collaborator (see §1 of the design this crate implements).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;

type Result<T> = std::result::Result<T, QueueError>;

/// Event fired by a [`KvStore`] after a mutation, for subscribers that want
/// to observe writes without polling.
#[derive(Debug, Clone)]
pub enum KvEvent {
    Put(String),
    Get(String),
    Delete(String),
    ClearAll,
}

/// Scalar-keyed, opaque-valued key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn size(&self) -> Result<usize>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory [`KvStore`] with a best-effort event log for tests and demos.
pub struct InMemoryKvStore {
    data: RwLock<HashMap<String, Value>>,
    events: RwLock<Vec<KvEvent>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<KvEvent> {
        self.events.read().clone()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        self.events.write().push(KvEvent::Put(key.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.events.write().push(KvEvent::Get(key.to_string()));
        Ok(self.data.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.data.write().remove(key).is_some();
        self.events.write().push(KvEvent::Delete(key.to_string()));
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.data.write().clear();
        self.events.write().push(KvEvent::ClearAll);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.data.read().len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }
}

/// A row stored in a [`TabularStore`]: must be able to report its own
/// primary key and the values of any declared secondary indexes.
pub trait TabularRow: Clone + Serialize + Send + Sync {
    /// Stable, unique key. Compound keys are the caller's responsibility to
    /// encode (e.g. `"workspace:task"`).
    fn primary_key(&self) -> String;

    /// Value of a named secondary index, if this row participates in it.
    fn index_value(&self, index: &str) -> Option<Value>;
}

/// Schema-defined columns with a primary key and a set of searchable
/// secondary indexes. The in-memory backend has no cost model worth
/// protecting, so `search` is a scan-and-filter over `index_value(index)`
/// regardless of whether `index` names a declared index; a real backend is
/// expected to give declared indexes a faster path.
#[async_trait]
pub trait TabularStore<R: TabularRow>: Send + Sync {
    async fn insert(&self, row: R) -> Result<()>;
    async fn upsert(&self, row: R) -> Result<()>;
    async fn update(&self, row: R) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<R>>;
    async fn search(&self, index: &str, value: &Value) -> Result<Vec<R>>;
    async fn get_all(&self) -> Result<Vec<R>>;
}

pub struct InMemoryTabularStore<R: TabularRow> {
    rows: RwLock<HashMap<String, R>>,
}

impl<R: TabularRow> InMemoryTabularStore<R> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: TabularRow> Default for InMemoryTabularStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: TabularRow + 'static> TabularStore<R> for InMemoryTabularStore<R> {
    async fn insert(&self, row: R) -> Result<()> {
        let key = row.primary_key();
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(QueueError::Validation(format!(
                "row with key {key:?} already exists"
            )));
        }
        rows.insert(key, row);
        Ok(())
    }

    async fn upsert(&self, row: R) -> Result<()> {
        self.rows.write().insert(row.primary_key(), row);
        Ok(())
    }

    async fn update(&self, row: R) -> Result<()> {
        let key = row.primary_key();
        let mut rows = self.rows.write();
        if !rows.contains_key(&key) {
            return Err(QueueError::Validation(format!("row with key {key:?} not found")));
        }
        rows.insert(key, row);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.rows.write().remove(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.rows.read().get(key).cloned())
    }

    async fn search(&self, index: &str, value: &Value) -> Result<Vec<R>> {
        // Whether `index` is declared changes nothing about the in-memory
        // backend's cost model, so a declared index and an undeclared one
        // both resolve to the same scan-and-filter.
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.index_value(index).as_ref() == Some(value))
            .cloned()
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<R>> {
        Ok(self.rows.read().values().cloned().collect())
    }
}

pub type SharedKvStore = Arc<dyn KvStore>;
