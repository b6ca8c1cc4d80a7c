//! Deferred write operations and their dedup fingerprints

use crate::vector_db::{CollectionKind, EmbeddingRecord, PathUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Operation kinds, in the on-disk spelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    UpsertFile,
    UpsertFolder,
    DeleteFile,
    DeleteFolder,
    BatchUpsertFiles,
    BatchUpsertFolders,
    BatchDeleteFiles,
    BatchDeleteFolders,
    UpdateFilePaths,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UpsertFile => "upsert_file",
            OperationKind::UpsertFolder => "upsert_folder",
            OperationKind::DeleteFile => "delete_file",
            OperationKind::DeleteFolder => "delete_folder",
            OperationKind::BatchUpsertFiles => "batch_upsert_files",
            OperationKind::BatchUpsertFolders => "batch_upsert_folders",
            OperationKind::BatchDeleteFiles => "batch_delete_files",
            OperationKind::BatchDeleteFolders => "batch_delete_folders",
            OperationKind::UpdateFilePaths => "update_file_paths",
        }
    }

    /// Lower dequeues first: deletes, then single upserts, batch upserts, path updates
    pub fn priority(&self) -> u8 {
        match self {
            OperationKind::DeleteFile
            | OperationKind::DeleteFolder
            | OperationKind::BatchDeleteFiles
            | OperationKind::BatchDeleteFolders => 1,
            OperationKind::UpsertFile | OperationKind::UpsertFolder => 2,
            OperationKind::BatchUpsertFiles | OperationKind::BatchUpsertFolders => 3,
            OperationKind::UpdateFilePaths => 4,
        }
    }

    /// Operations in the same scope touching the same ids supersede each other
    fn dedup_scope(&self) -> &'static str {
        match self {
            OperationKind::UpsertFile
            | OperationKind::DeleteFile
            | OperationKind::BatchUpsertFiles
            | OperationKind::BatchDeleteFiles => "files",
            OperationKind::UpsertFolder
            | OperationKind::DeleteFolder
            | OperationKind::BatchUpsertFolders
            | OperationKind::BatchDeleteFolders => "folders",
            OperationKind::UpdateFilePaths => "file_paths",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write waiting for the server, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Operation {
    UpsertFile(EmbeddingRecord),
    UpsertFolder(EmbeddingRecord),
    DeleteFile { id: String },
    DeleteFolder { id: String },
    BatchUpsertFiles(Vec<EmbeddingRecord>),
    BatchUpsertFolders(Vec<EmbeddingRecord>),
    BatchDeleteFiles { ids: Vec<String> },
    BatchDeleteFolders { ids: Vec<String> },
    UpdateFilePaths(Vec<PathUpdate>),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::UpsertFile(_) => OperationKind::UpsertFile,
            Operation::UpsertFolder(_) => OperationKind::UpsertFolder,
            Operation::DeleteFile { .. } => OperationKind::DeleteFile,
            Operation::DeleteFolder { .. } => OperationKind::DeleteFolder,
            Operation::BatchUpsertFiles(_) => OperationKind::BatchUpsertFiles,
            Operation::BatchUpsertFolders(_) => OperationKind::BatchUpsertFolders,
            Operation::BatchDeleteFiles { .. } => OperationKind::BatchDeleteFiles,
            Operation::BatchDeleteFolders { .. } => OperationKind::BatchDeleteFolders,
            Operation::UpdateFilePaths(_) => OperationKind::UpdateFilePaths,
        }
    }

    pub fn priority(&self) -> u8 {
        self.kind().priority()
    }

    /// Collection the operation writes to
    pub fn collection(&self) -> CollectionKind {
        match self {
            Operation::UpsertFolder(_)
            | Operation::DeleteFolder { .. }
            | Operation::BatchUpsertFolders(_)
            | Operation::BatchDeleteFolders { .. } => CollectionKind::Folders,
            _ => CollectionKind::Files,
        }
    }

    /// Batch operations move more data and get the longer timeout
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            Operation::BatchUpsertFiles(_)
                | Operation::BatchUpsertFolders(_)
                | Operation::BatchDeleteFiles { .. }
                | Operation::BatchDeleteFolders { .. }
                | Operation::UpdateFilePaths(_)
        )
    }

    /// Every record id the operation touches
    pub fn affected_ids(&self) -> Vec<&str> {
        match self {
            Operation::UpsertFile(r) | Operation::UpsertFolder(r) => vec![r.id.as_str()],
            Operation::DeleteFile { id } | Operation::DeleteFolder { id } => vec![id.as_str()],
            Operation::BatchUpsertFiles(rs) | Operation::BatchUpsertFolders(rs) => {
                rs.iter().map(|r| r.id.as_str()).collect()
            }
            Operation::BatchDeleteFiles { ids } | Operation::BatchDeleteFolders { ids } => {
                ids.iter().map(String::as_str).collect()
            }
            Operation::UpdateFilePaths(updates) => updates
                .iter()
                .flat_map(|u| [u.old_id.as_str(), u.new_id.as_str()])
                .collect(),
        }
    }

    /// Stable fingerprint: scope plus the sorted, distinct affected ids
    pub fn dedup_key(&self) -> String {
        let scope = self.kind().dedup_scope();
        let mut ids = self.affected_ids();
        ids.sort_unstable();
        ids.dedup();

        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        for id in ids {
            hasher.update(b"\n");
            hasher.update(id.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        format!("{}:{}", scope, &digest[..16])
    }
}

/// Queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: Uuid,
    pub operation: Operation,
    pub key: String,
    pub priority: u8,
    pub retries: u32,
    pub max_retries: u32,
    /// FIFO position within a priority tier
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn new(operation: Operation, max_retries: u32, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: operation.dedup_key(),
            priority: operation.priority(),
            operation,
            retries: 0,
            max_retries,
            sequence,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Replace the payload with a newer one for the same key
    pub(crate) fn supersede(&mut self, operation: Operation) {
        self.priority = operation.priority();
        self.operation = operation;
        self.retries = 0;
        self.updated_at = Utc::now();
    }

    /// Sort key: priority first, then arrival order
    pub(crate) fn order(&self) -> (u8, u64) {
        (self.priority, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> EmbeddingRecord {
        EmbeddingRecord::new(id, vec![0.1, 0.2])
    }

    #[test]
    fn test_priorities() {
        assert!(Operation::DeleteFile { id: "a".into() }.priority() < Operation::UpsertFile(record("a")).priority());
        assert!(Operation::UpsertFolder(record("a")).priority() < Operation::BatchUpsertFolders(vec![]).priority());
        assert!(Operation::BatchUpsertFiles(vec![]).priority() < Operation::UpdateFilePaths(vec![]).priority());
        assert_eq!(
            Operation::BatchDeleteFolders { ids: vec![] }.priority(),
            Operation::DeleteFile { id: "x".into() }.priority()
        );
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = Operation::BatchDeleteFiles { ids: vec!["x".into(), "y".into()] };
        let b = Operation::BatchDeleteFiles { ids: vec!["y".into(), "x".into(), "x".into()] };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_key_scopes() {
        let file = Operation::UpsertFile(record("same"));
        let delete = Operation::DeleteFile { id: "same".into() };
        let folder = Operation::UpsertFolder(record("same"));

        // later intent for the same file supersedes the earlier one
        assert_eq!(file.dedup_key(), delete.dedup_key());
        assert_ne!(file.dedup_key(), folder.dedup_key());
        assert!(file.dedup_key().starts_with("files:"));
    }

    #[test]
    fn test_serialized_shape() {
        let queued = QueuedOperation::new(Operation::DeleteFolder { id: "d1".into() }, 3, 7);
        let value = serde_json::to_value(&queued).unwrap();

        assert_eq!(value["operation"]["type"], "delete_folder");
        assert_eq!(value["operation"]["data"]["id"], "d1");
        assert_eq!(value["maxRetries"], 3);
        assert_eq!(value["priority"], 1);

        let back: QueuedOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, queued);
    }
}
