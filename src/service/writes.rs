//! Write path: validate, guard, apply or queue

use super::dimension::{validate_ids, validate_path_updates, validate_record, validate_records};
use super::index_metadata::{write_index_metadata, IndexMetadata};
use super::{with_timeout, Connection, ServiceEvent, ServiceInner, VectorDbService};
use crate::cache::keys;
use crate::error::{Result, ValidationError};
use crate::queue::{EnqueueOutcome, Operation, OperationProcessor};
use crate::vector_db::{CollectionKind, EmbeddingRecord, PathUpdate};
use async_trait::async_trait;
use futures::future::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What happened to a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Stored on the server
    Applied { count: usize },
    /// Server unavailable; saved for replay
    Queued,
    /// Server unavailable and the queue had no room
    Dropped { reason: String },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued)
    }
}

impl VectorDbService {
    pub async fn upsert_file(&self, record: EmbeddingRecord) -> Result<WriteOutcome> {
        self.inner.write(Operation::UpsertFile(record)).await
    }

    pub async fn upsert_folder(&self, record: EmbeddingRecord) -> Result<WriteOutcome> {
        self.inner.write(Operation::UpsertFolder(record)).await
    }

    pub async fn batch_upsert_files(&self, records: Vec<EmbeddingRecord>) -> Result<WriteOutcome> {
        if records.is_empty() {
            return Ok(WriteOutcome::Applied { count: 0 });
        }
        self.inner.write(Operation::BatchUpsertFiles(records)).await
    }

    pub async fn batch_upsert_folders(&self, records: Vec<EmbeddingRecord>) -> Result<WriteOutcome> {
        if records.is_empty() {
            return Ok(WriteOutcome::Applied { count: 0 });
        }
        self.inner.write(Operation::BatchUpsertFolders(records)).await
    }

    pub async fn delete_file(&self, id: impl Into<String>) -> Result<WriteOutcome> {
        self.inner.write(Operation::DeleteFile { id: id.into() }).await
    }

    pub async fn delete_folder(&self, id: impl Into<String>) -> Result<WriteOutcome> {
        self.inner.write(Operation::DeleteFolder { id: id.into() }).await
    }

    pub async fn batch_delete_files(&self, ids: Vec<String>) -> Result<WriteOutcome> {
        if ids.is_empty() {
            return Ok(WriteOutcome::Applied { count: 0 });
        }
        self.inner.write(Operation::BatchDeleteFiles { ids }).await
    }

    pub async fn batch_delete_folders(&self, ids: Vec<String>) -> Result<WriteOutcome> {
        if ids.is_empty() {
            return Ok(WriteOutcome::Applied { count: 0 });
        }
        self.inner.write(Operation::BatchDeleteFolders { ids }).await
    }

    /// Re-key moved files, keeping their vectors
    pub async fn update_file_paths(&self, updates: Vec<PathUpdate>) -> Result<WriteOutcome> {
        if updates.is_empty() {
            return Ok(WriteOutcome::Applied { count: 0 });
        }
        self.inner.write(Operation::UpdateFilePaths(updates)).await
    }
}

impl ServiceInner {
    async fn write(self: &Arc<Self>, operation: Operation) -> Result<WriteOutcome> {
        self.validate_operation(&operation)?;

        match self.execute_write(&operation).await {
            Ok(count) => Ok(WriteOutcome::Applied { count }),
            Err(e) if e.is_transient() => {
                if e.is_circuit_open() {
                    debug!("Circuit open, queueing {}", operation.kind());
                } else {
                    warn!("{} failed, queueing for replay: {}", operation.kind(), e);
                }
                Ok(self.defer(operation))
            }
            Err(e) => Err(e),
        }
    }

    /// Reject bad input before it can reach the server or the queue
    pub(crate) fn validate_operation(&self, operation: &Operation) -> Result<()> {
        let kind = operation.collection();
        match operation {
            Operation::UpsertFile(record) | Operation::UpsertFolder(record) => {
                let dim = validate_record(record)?;
                self.check_dimension(kind, dim)?;
            }
            Operation::BatchUpsertFiles(records) | Operation::BatchUpsertFolders(records) => {
                if let Some(dim) = validate_records(records)? {
                    self.check_dimension(kind, dim)?;
                }
            }
            Operation::DeleteFile { id } | Operation::DeleteFolder { id } => {
                validate_ids(std::iter::once(id))?;
            }
            Operation::BatchDeleteFiles { ids } | Operation::BatchDeleteFolders { ids } => {
                validate_ids(ids)?;
            }
            Operation::UpdateFilePaths(updates) => validate_path_updates(updates)?,
        }
        Ok(())
    }

    pub(crate) fn check_dimension(&self, kind: CollectionKind, actual: usize) -> Result<()> {
        if let Err(e) = self.dimensions.check(kind, actual) {
            if let ValidationError::DimensionMismatch { expected, actual, .. } = &e {
                warn!("Rejected {}-dimensional vector for {} (expected {})", actual, kind, expected);
                self.emit(ServiceEvent::DimensionMismatch {
                    collection: kind,
                    expected: *expected,
                    actual: *actual,
                });
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply behind the breaker, then invalidate and record the dimension
    pub(crate) async fn execute_write(self: &Arc<Self>, operation: &Operation) -> Result<usize> {
        let kind = operation.kind();
        let count = self
            .guarded(kind.as_str(), |conn| {
                let inner = self.clone();
                let operation = operation.clone();
                async move { inner.apply(&conn, &operation).await }.boxed()
            })
            .await?;

        self.after_write(operation).await;
        Ok(count)
    }

    /// One remote call per operation kind
    async fn apply(&self, conn: &Connection, operation: &Operation) -> Result<usize> {
        let timeouts = &self.config.timeouts;
        let timeout = if operation.is_batch() {
            timeouts.batch_operation()
        } else {
            timeouts.operation()
        };
        let name = operation.kind().as_str();
        let handle = conn.handle(operation.collection());

        match operation {
            Operation::UpsertFile(record) | Operation::UpsertFolder(record) => {
                with_timeout(name, timeout, conn.store.upsert(handle, vec![record.clone()])).await?;
                Ok(1)
            }
            Operation::BatchUpsertFiles(records) | Operation::BatchUpsertFolders(records) => {
                if records.is_empty() {
                    return Ok(0);
                }
                with_timeout(name, timeout, conn.store.upsert(handle, records.clone())).await?;
                Ok(records.len())
            }
            Operation::DeleteFile { id } | Operation::DeleteFolder { id } => {
                with_timeout(name, timeout, conn.store.delete(handle, vec![id.clone()])).await?;
                Ok(1)
            }
            Operation::BatchDeleteFiles { ids } | Operation::BatchDeleteFolders { ids } => {
                if ids.is_empty() {
                    return Ok(0);
                }
                with_timeout(name, timeout, conn.store.delete(handle, ids.clone())).await?;
                Ok(ids.len())
            }
            Operation::UpdateFilePaths(updates) => self.move_files(conn, updates, timeout).await,
        }
    }

    /// Fetch old records with vectors, store them under the new ids, drop the old ids
    async fn move_files(&self, conn: &Connection, updates: &[PathUpdate], timeout: Duration) -> Result<usize> {
        let old_ids: Vec<String> = updates.iter().map(|u| u.old_id.clone()).collect();
        let existing = with_timeout(
            "update_file_paths",
            timeout,
            conn.store.get(&conn.files, Some(old_ids), None, true),
        )
        .await?;
        let by_id: HashMap<&str, &EmbeddingRecord> = existing.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut moved = Vec::new();
        let mut stale = Vec::new();
        for update in updates {
            let Some(record) = by_id.get(update.old_id.as_str()) else {
                debug!("File {} not stored, nothing to move", update.old_id);
                continue;
            };
            let mut record = (*record).clone();
            record.id = update.new_id.clone();
            record.metadata.insert("path".to_string(), update.new_path.clone().into());
            if let Some(name) = &update.new_name {
                record.metadata.insert("name".to_string(), name.clone().into());
            }
            moved.push(record);
            if update.old_id != update.new_id {
                stale.push(update.old_id.clone());
            }
        }

        if moved.is_empty() {
            return Ok(0);
        }

        let count = moved.len();
        with_timeout("update_file_paths", timeout, conn.store.upsert(&conn.files, moved)).await?;
        if !stale.is_empty() {
            with_timeout("update_file_paths", timeout, conn.store.delete(&conn.files, stale)).await?;
        }
        Ok(count)
    }

    async fn after_write(&self, operation: &Operation) {
        match operation.collection() {
            CollectionKind::Files => {
                for id in operation.affected_ids() {
                    self.cache.invalidate_for_entity(id);
                }
                self.cache.invalidate_for_category(keys::FILES_PREFIX);
            }
            CollectionKind::Folders => {
                self.cache.invalidate_for_category(keys::FOLDERS_PREFIX);
            }
        }

        let dimension = match operation {
            Operation::UpsertFile(record) | Operation::UpsertFolder(record) => Some(record.dimension()),
            Operation::BatchUpsertFiles(records) | Operation::BatchUpsertFolders(records) => {
                records.first().map(EmbeddingRecord::dimension)
            }
            _ => None,
        };

        if let Some(dim) = dimension {
            let kind = operation.collection();
            if self.dimensions.establish(kind, dim) {
                debug!("{} collection fixed at {} dimensions", kind, dim);
                self.record_index_metadata(kind, dim).await;
            }
        }
    }

    async fn record_index_metadata(&self, kind: CollectionKind, dims: usize) {
        let settings = &self.config.index_metadata;
        let Some(path) = settings.path.as_deref() else {
            return;
        };
        let source = match kind {
            CollectionKind::Files => &self.config.server.files_collection,
            CollectionKind::Folders => &self.config.server.folders_collection,
        };
        let metadata = IndexMetadata::new(settings.embedding_model.clone(), dims).with_source(source.clone());
        if let Err(e) = write_index_metadata(path, &metadata).await {
            warn!("Could not write index metadata: {}", e);
        }
    }

    fn defer(&self, operation: Operation) -> WriteOutcome {
        let kind = operation.kind();
        match self.queue.enqueue(operation) {
            EnqueueOutcome::Dropped { reason } => {
                warn!("Could not queue {}: {}", kind, reason);
                WriteOutcome::Dropped { reason }
            }
            _ => {
                self.emit(ServiceEvent::OperationQueued {
                    kind,
                    queue_size: self.queue.len(),
                });
                WriteOutcome::Queued
            }
        }
    }
}

/// Replays queued operations through the normal write path
pub(crate) struct QueueReplay {
    inner: Arc<ServiceInner>,
}

impl QueueReplay {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl OperationProcessor for QueueReplay {
    async fn process(&self, operation: &Operation) -> Result<()> {
        self.inner.validate_operation(operation)?;
        self.inner.execute_write(operation).await.map(|_| ())
    }
}
