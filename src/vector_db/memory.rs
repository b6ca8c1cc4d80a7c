//! In-process vector store.
//!
//! Mirrors the remote server closely enough to exercise the coordinator:
//! collections get fresh ids when storage is recreated, so handles taken
//! before a `restart` report "does not exist" just like a restarted server.

use super::models::{sanitize_metadata, CollectionHandle, EmbeddingRecord, QueryMatch, QueryParams};
use super::VectorStore;
use crate::error::{Result, VectorDbError};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct Collection {
    id: String,
    records: IndexMap<String, EmbeddingRecord>,
}

/// Vector store kept entirely in memory, cosine distance
#[derive(Default)]
pub struct InMemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    unreachable: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the server going away (`false`) or coming back (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Drop all storage, as a server restart with a wiped data directory does
    pub fn restart(&self) {
        self.collections.lock().clear();
    }

    /// Requests served so far, heartbeats included
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Direct lookup that bypasses reachability, for assertions
    pub fn record(&self, collection: &str, id: &str) -> Option<EmbeddingRecord> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.records.get(id).cloned())
    }

    /// Direct size lookup that bypasses reachability
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VectorDbError::Unavailable("connection refused".to_string()).into());
        }
        Ok(())
    }

    fn with_collection<T>(
        &self,
        handle: &CollectionHandle,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T> {
        let mut collections = self.collections.lock();
        match collections.get_mut(&handle.name) {
            Some(c) if c.id == handle.id => Ok(f(c)),
            _ => Err(VectorDbError::CollectionNotFound(format!(
                "Collection {} does not exist.",
                handle.id
            ))
            .into()),
        }
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn heartbeat(&self) -> Result<u64> {
        self.enter()?;
        Ok(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64)
    }

    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle> {
        self.enter()?;
        let mut collections = self.collections.lock();
        let collection = collections.entry(name.to_string()).or_insert_with(|| Collection {
            id: Uuid::new_v4().to_string(),
            records: IndexMap::new(),
        });
        Ok(CollectionHandle {
            id: collection.id.clone(),
            name: name.to_string(),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.enter()?;
        self.collections
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VectorDbError::CollectionNotFound(format!("Collection {} does not exist.", name)).into())
    }

    async fn upsert(&self, collection: &CollectionHandle, records: Vec<EmbeddingRecord>) -> Result<()> {
        self.enter()?;
        self.with_collection(collection, |c| {
            for mut record in records {
                record.metadata = sanitize_metadata(&record.metadata);
                c.records.insert(record.id.clone(), record);
            }
        })
    }

    async fn query(&self, collection: &CollectionHandle, params: QueryParams) -> Result<Vec<QueryMatch>> {
        self.enter()?;
        self.with_collection(collection, |c| {
            let mut matches: Vec<QueryMatch> = c
                .records
                .values()
                .map(|r| {
                    QueryMatch::from_distance(
                        r.id.clone(),
                        cosine_distance(&params.vector, &r.vector),
                        r.metadata.clone(),
                        r.document.clone(),
                    )
                })
                .collect();
            matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            matches.truncate(params.top_k);
            matches
        })
    }

    async fn get(
        &self,
        collection: &CollectionHandle,
        ids: Option<Vec<String>>,
        limit: Option<usize>,
        include_vectors: bool,
    ) -> Result<Vec<EmbeddingRecord>> {
        self.enter()?;
        self.with_collection(collection, |c| {
            let selected: Vec<EmbeddingRecord> = match ids {
                Some(ids) => ids.iter().filter_map(|id| c.records.get(id).cloned()).collect(),
                None => c.records.values().cloned().collect(),
            };
            selected
                .into_iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|mut r| {
                    if !include_vectors {
                        r.vector.clear();
                    }
                    r
                })
                .collect()
        })
    }

    async fn delete(&self, collection: &CollectionHandle, ids: Vec<String>) -> Result<()> {
        self.enter()?;
        self.with_collection(collection, |c| {
            for id in ids {
                c.records.shift_remove(&id);
            }
        })
    }

    async fn count(&self, collection: &CollectionHandle) -> Result<usize> {
        self.enter()?;
        self.with_collection(collection, |c| c.records.len())
    }
}
