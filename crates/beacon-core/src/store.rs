//! Read-side contract of the record store.
//!
//! The broker never writes records. Mutations happen in the API layer, which
//! reports them through [`crate::EventProcessor`] once they are committed.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not serve the request.
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// The query was rejected by the store.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// A bounded listing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    /// Maximum number of items to return.
    pub limit: usize,
    /// Field equality filters.
    pub filters: Map<String, Value>,
}

impl ListQuery {
    /// Create a query with the given limit and no filters.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            filters: Map::new(),
        }
    }

    /// Attach equality filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Map<String, Value>) -> Self {
        self.filters = filters;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Records, newest first, at most `limit` of them.
    pub items: Vec<T>,
    /// Number of records matching the query.
    pub total: u64,
}

impl<T> Page<T> {
    /// An empty page.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// A store of records of type `T`.
#[async_trait]
pub trait RecordStore<T>: Send + Sync {
    /// List records matching the query, newest first.
    async fn list(&self, query: &ListQuery) -> Result<Page<T>, StoreError>;
}
