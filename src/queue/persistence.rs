//! On-disk queue file.
//!
//! Layout: `{ "version": 1, "timestamp": ..., "queue": [...], "stats": {...} }`.
//! Loading never fails: an unreadable or unknown-version file means starting
//! empty, and individual entries that no longer parse are skipped.

use super::operation::QueuedOperation;
use super::QueueStats;
use crate::error::{QueueError, Result};
use crate::persist::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

pub const QUEUE_FILE_VERSION: u64 = 1;

#[derive(Serialize)]
struct QueueFile<'a> {
    version: u64,
    timestamp: DateTime<Utc>,
    queue: &'a [QueuedOperation],
    stats: &'a QueueStats,
}

/// Result of reading the queue file
#[derive(Debug, Default)]
pub struct LoadedQueue {
    pub operations: Vec<QueuedOperation>,
    pub stats: QueueStats,
    /// Entries that could not be parsed
    pub skipped: usize,
}

pub async fn save_queue(path: &Path, operations: &[QueuedOperation], stats: &QueueStats) -> Result<()> {
    let file = QueueFile {
        version: QUEUE_FILE_VERSION,
        timestamp: Utc::now(),
        queue: operations,
        stats,
    };
    write_json_atomic(path, &file)
        .await
        .map_err(|e| QueueError::Persistence(e.to_string()).into())
}

pub async fn load_queue(path: &Path) -> LoadedQueue {
    let document: Value = match read_json(path).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!("No queue file at {}, starting empty", path.display());
            return LoadedQueue::default();
        }
        Err(e) => {
            warn!("Queue file {} unreadable, starting empty: {}", path.display(), e);
            return LoadedQueue::default();
        }
    };

    match document.get("version").and_then(Value::as_u64) {
        Some(QUEUE_FILE_VERSION) => {}
        other => {
            warn!(
                "Queue file {} has unsupported version {:?}, starting empty",
                path.display(),
                other
            );
            return LoadedQueue::default();
        }
    }

    let stats = document
        .get("stats")
        .cloned()
        .and_then(|s| serde_json::from_value(s).ok())
        .unwrap_or_default();

    let mut loaded = LoadedQueue {
        stats,
        ..Default::default()
    };

    let entries = match document.get("queue") {
        Some(Value::Array(entries)) => entries.clone(),
        _ => Vec::new(),
    };

    for entry in entries {
        match serde_json::from_value::<QueuedOperation>(entry) {
            Ok(op) => loaded.operations.push(op),
            Err(e) => {
                loaded.skipped += 1;
                warn!("Skipping unreadable queue entry: {}", e);
            }
        }
    }

    info!(
        "Loaded {} queued operations from {} ({} skipped)",
        loaded.operations.len(),
        path.display(),
        loaded.skipped
    );
    loaded
}
