//! Read path: cache, then in-flight dedup, then the server.
//!
//! An open breaker or a transient failure yields an empty result; only bad
//! input and permanent server refusals reach the caller as errors.

use super::dimension::validate_vector;
use super::{with_timeout, Connection, ServiceInner, VectorDbService};
use crate::cache::keys;
use crate::error::{Result, ValidationError};
use crate::vector_db::{CollectionKind, EmbeddingRecord, QueryMatch, QueryParams};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cached read results
#[derive(Debug, Clone)]
pub enum CachedRead {
    Matches(Arc<Vec<QueryMatch>>),
    Records(Arc<Vec<EmbeddingRecord>>),
}

impl CachedRead {
    fn into_matches(self) -> Vec<QueryMatch> {
        match self {
            CachedRead::Matches(matches) => matches.as_ref().clone(),
            CachedRead::Records(_) => Vec::new(),
        }
    }

    fn into_records(self) -> Vec<EmbeddingRecord> {
        match self {
            CachedRead::Records(records) => records.as_ref().clone(),
            CachedRead::Matches(_) => Vec::new(),
        }
    }
}

impl VectorDbService {
    /// Folders closest to a stored file's vector; empty if the file has none
    pub async fn query_folders(&self, file_id: &str, top_k: usize) -> Result<Vec<QueryMatch>> {
        if file_id.trim().is_empty() {
            return Err(ValidationError::MissingId.into());
        }
        let top_k = self.inner.top_k(top_k);
        let key = keys::folders_for_file(file_id, top_k);
        let file_id = file_id.to_string();
        let timeout = self.inner.config.timeouts.operation();

        let read = self
            .inner
            .read(key, move |inner| {
                async move {
                    let checker = inner.clone();
                    inner
                        .guarded("query_folders", move |conn: Arc<Connection>| {
                            let file_id = file_id.clone();
                            let checker = checker.clone();
                            async move {
                                let files = with_timeout(
                                    "get",
                                    timeout,
                                    conn.store.get(&conn.files, Some(vec![file_id.clone()]), None, true),
                                )
                                .await?;

                                let vector = files.into_iter().next().map(|r| r.vector).unwrap_or_default();
                                if vector.is_empty() {
                                    debug!("File {} has no stored vector", file_id);
                                    return Ok(Vec::new());
                                }
                                checker.check_dimension(CollectionKind::Folders, vector.len())?;

                                with_timeout(
                                    "query",
                                    timeout,
                                    conn.store.query(&conn.folders, QueryParams::new(vector, top_k)),
                                )
                                .await
                            }
                            .boxed()
                        })
                        .await
                        .map(|matches| CachedRead::Matches(Arc::new(matches)))
                }
                .boxed()
            })
            .await?;

        Ok(read.map(CachedRead::into_matches).unwrap_or_default())
    }

    /// Folders closest to an arbitrary vector
    pub async fn query_folders_by_embedding(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<QueryMatch>> {
        self.inner
            .nearest(CollectionKind::Folders, "query_folders_by_embedding", vector, top_k)
            .await
    }

    /// Files closest to an arbitrary vector
    pub async fn query_similar_files(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<QueryMatch>> {
        self.inner
            .nearest(CollectionKind::Files, "query_similar_files", vector, top_k)
            .await
    }

    /// Every folder record, without vectors
    pub async fn get_all_folders(&self) -> Result<Vec<EmbeddingRecord>> {
        let timeout = self.inner.config.timeouts.batch_operation();

        let read = self
            .inner
            .read(keys::ALL_FOLDERS.to_string(), move |inner| {
                async move {
                    inner
                        .guarded("get_all_folders", move |conn: Arc<Connection>| {
                            async move {
                                with_timeout("get", timeout, conn.store.get(&conn.folders, None, None, false)).await
                            }
                            .boxed()
                        })
                        .await
                        .map(|records| CachedRead::Records(Arc::new(records)))
                }
                .boxed()
            })
            .await?;

        Ok(read.map(CachedRead::into_records).unwrap_or_default())
    }
}

impl ServiceInner {
    pub(crate) fn top_k(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.query.default_top_k
        } else {
            requested
        }
    }

    async fn nearest(
        self: &Arc<Self>,
        kind: CollectionKind,
        operation: &'static str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<QueryMatch>> {
        let dim = validate_vector(&vector)?;
        self.check_dimension(kind, dim)?;

        let top_k = self.top_k(top_k);
        let key = match kind {
            CollectionKind::Files => keys::similar_files(&vector, top_k),
            CollectionKind::Folders => keys::folders_for_embedding(&vector, top_k),
        };
        let params = QueryParams::new(vector, top_k);
        let timeout = self.config.timeouts.operation();

        let read = self
            .read(key, move |inner| {
                async move {
                    inner
                        .guarded(operation, move |conn: Arc<Connection>| {
                            let params = params.clone();
                            async move { with_timeout("query", timeout, conn.store.query(conn.handle(kind), params)).await }
                                .boxed()
                        })
                        .await
                        .map(|matches| CachedRead::Matches(Arc::new(matches)))
                }
                .boxed()
            })
            .await?;

        Ok(read.map(CachedRead::into_matches).unwrap_or_default())
    }

    /// Serve from cache, join an identical read in flight, or fetch.
    ///
    /// `Ok(None)` means the read degraded: the breaker is open or the server
    /// failed transiently.
    async fn read<F>(self: &Arc<Self>, key: String, fetch: F) -> Result<Option<CachedRead>>
    where
        F: FnOnce(Arc<Self>) -> BoxFuture<'static, Result<CachedRead>>,
    {
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit));
        }

        // joined flights started under this same generation, so a write since
        // then both forks a new call and fails the freshness check below
        let generation = self.cache.generation();
        let inner = self.clone();
        match self.inflight.run(&key, generation, move || fetch(inner)).await {
            Ok(value) => {
                self.cache.set_if_fresh(key, value.clone(), generation);
                Ok(Some(value))
            }
            Err(e) if e.is_validation() => Err(e),
            Err(e) if e.is_transient() => {
                warn!("Read {} degraded to an empty result: {}", key, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
