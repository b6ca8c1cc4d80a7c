//! Vector database integration: remote client, in-memory store and circuit breaker

pub mod circuit_breaker;
pub mod client;
pub mod memory;
pub mod models;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, StateTransition};
pub use client::ChromaClient;
pub use memory::InMemoryStore;
pub use models::{
    sanitize_metadata, CollectionHandle, CollectionKind, EmbeddingRecord, Metadata, PathUpdate, QueryMatch,
    QueryParams,
};

use crate::config::ServerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for vector storage operations against one server
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Server heartbeat; returns the server clock in nanoseconds
    async fn heartbeat(&self) -> Result<u64>;

    /// Get a collection, creating it if missing
    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle>;

    /// Delete a collection and everything in it
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Insert or replace records
    async fn upsert(&self, collection: &CollectionHandle, records: Vec<EmbeddingRecord>) -> Result<()>;

    /// Nearest neighbours of a vector
    async fn query(&self, collection: &CollectionHandle, params: QueryParams) -> Result<Vec<QueryMatch>>;

    /// Fetch records by id; `None` fetches up to `limit` records
    async fn get(
        &self,
        collection: &CollectionHandle,
        ids: Option<Vec<String>>,
        limit: Option<usize>,
        include_vectors: bool,
    ) -> Result<Vec<EmbeddingRecord>>;

    /// Delete records by id
    async fn delete(&self, collection: &CollectionHandle, ids: Vec<String>) -> Result<()>;

    /// Number of records in a collection
    async fn count(&self, collection: &CollectionHandle) -> Result<usize>;
}

/// Builds a store client for a server; lets tests substitute a fake remote
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn VectorStore>>;
}

/// Default factory producing HTTP clients
pub struct ChromaStoreFactory {
    request_timeout: std::time::Duration,
}

impl ChromaStoreFactory {
    pub fn new(request_timeout: std::time::Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl StoreFactory for ChromaStoreFactory {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn VectorStore>> {
        let client = ChromaClient::new(config, self.request_timeout)?;
        Ok(Arc::new(client))
    }
}

/// Factory that hands out one pre-built store on every connect
pub struct SharedStoreFactory {
    store: Arc<dyn VectorStore>,
}

impl SharedStoreFactory {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreFactory for SharedStoreFactory {
    async fn connect(&self, _config: &ServerConfig) -> Result<Arc<dyn VectorStore>> {
        Ok(self.store.clone())
    }
}
