//! In-memory record store.
//!
//! Backs the mutation API and serves initial snapshots to plugins. Records
//! are listed newest first.

use async_trait::async_trait;
use beacon_core::{ListQuery, Page, RecordStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A record kept by a [`MemoryStore`].
pub trait Record: Clone + Serialize + Send + Sync + 'static {
    /// Primary key.
    fn id(&self) -> u64;

    /// Assign the primary key on insert.
    fn set_id(&mut self, id: u64);

    /// Timestamp records are ordered by, newest first.
    fn sorted_at(&self) -> DateTime<Utc>;

    /// Serialized field names accepted as listing filters.
    const FIELDS: &'static [&'static str];
}

/// Thread-safe in-memory table with auto-incrementing ids.
pub struct MemoryStore<T> {
    records: RwLock<BTreeMap<u64, T>>,
    next_id: AtomicU64,
}

impl<T: Record> MemoryStore<T> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a record, assigning it a fresh id.
    pub fn insert(&self, mut record: T) -> T {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        record.set_id(id);
        self.records.write().insert(id, record.clone());
        record
    }

    /// Fetch a record by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<T> {
        self.records.read().get(&id).cloned()
    }

    /// Modify a record in place and return the new version.
    pub fn update<E>(&self, id: u64, apply: impl FnOnce(&mut T) -> Result<(), E>) -> Option<Result<T, E>> {
        let mut records = self.records.write();
        let record = records.get_mut(&id)?;
        let mut updated = record.clone();
        Some(apply(&mut updated).map(|()| {
            *record = updated.clone();
            updated
        }))
    }

    /// Remove a record, returning it.
    pub fn remove(&self, id: u64) -> Option<T> {
        self.records.write().remove(&id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn query(&self, query: &ListQuery) -> Result<Page<T>, StoreError> {
        check_filters::<T>(query)?;

        let records = self.records.read();
        let mut matching = Vec::new();
        for record in records.values() {
            if query.filters.is_empty() || matches_filters(record, query)? {
                matching.push(record.clone());
            }
        }
        drop(records);

        matching.sort_by(|a, b| {
            b.sorted_at()
                .cmp(&a.sorted_at())
                .then_with(|| b.id().cmp(&a.id()))
        });

        let total = matching.len() as u64;
        matching.truncate(query.limit);
        Ok(Page {
            items: matching,
            total,
        })
    }
}

impl<T: Record> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_filters<T: Record>(query: &ListQuery) -> Result<(), StoreError> {
    match query.filters.keys().find(|field| !T::FIELDS.contains(&field.as_str())) {
        Some(field) => Err(StoreError::InvalidQuery(format!("unknown filter field '{field}'"))),
        None => Ok(()),
    }
}

fn matches_filters<T: Serialize>(record: &T, query: &ListQuery) -> Result<bool, StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(StoreError::InvalidQuery("records cannot be filtered".into()));
    };

    for (field, expected) in &query.filters {
        match fields.get(field) {
            Some(actual) if actual == expected => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

#[async_trait]
impl<T: Record> RecordStore<T> for MemoryStore<T> {
    async fn list(&self, query: &ListQuery) -> Result<Page<T>, StoreError> {
        self.query(query)
    }
}
