//! Offline queue for writes that could not reach the server.
//!
//! Entries are deduplicated by fingerprint (a newer intent replaces the older
//! payload in place), ordered by priority then arrival, and bounded. Every
//! mutation schedules a debounced save when a queue file is configured.

pub mod operation;
pub mod persistence;

pub use operation::{Operation, OperationKind, QueuedOperation};

use crate::config::QueueSettings;
use crate::error::{QueueError, Result};
use crate::scheduler::Debouncer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_retries: u32,
    pub persist_path: Option<PathBuf>,
    pub persist_debounce: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_size: settings.max_size.max(1),
            batch_size: settings.batch_size.max(1),
            batch_delay: Duration::from_millis(settings.batch_delay_ms),
            max_retries: settings.max_retries.max(1),
            persist_path: settings.persist_path.clone(),
            persist_debounce: Duration::from_millis(settings.persist_debounce_ms),
        }
    }
}

/// What `enqueue` did with an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// An entry with the same fingerprint now carries the new payload
    Deduplicated,
    /// Added after evicting a less urgent entry
    AddedWithEviction { evicted_key: String },
    /// Queue full of more urgent work; the operation was not kept
    Dropped { reason: String },
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, EnqueueOutcome::Dropped { .. })
    }
}

/// Counters kept across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    pub deduplicated: u64,
    pub evicted: u64,
    pub flushes: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Stats plus the live size
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub size: usize,
    pub max_size: usize,
    pub flushing: bool,
    #[serde(flatten)]
    pub stats: QueueStats,
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub processed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub dropped: usize,
}

/// Notifications for observers
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued {
        kind: OperationKind,
        key: String,
        size: usize,
    },
    Deduplicated {
        kind: OperationKind,
        key: String,
    },
    Evicted {
        kind: OperationKind,
        key: String,
    },
    Dropped {
        kind: OperationKind,
        key: String,
        reason: String,
    },
    Flushed(FlushResult),
}

/// Applies one queued operation against the server
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    async fn process(&self, operation: &Operation) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueuedOperation>,
    /// Taken by a running flush; still saved so a crash does not lose them
    in_flight: Vec<QueuedOperation>,
    stats: QueueStats,
    next_sequence: u64,
}

impl QueueState {
    /// Least urgent entry: highest priority number, oldest among equals
    fn eviction_candidate(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.sequence.cmp(&a.sequence)))
            .map(|(i, _)| i)
    }

    fn most_urgent(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .min_by_key(|(_, op)| op.order())
            .map(|(i, _)| i)
    }
}

struct QueueShared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Serializes file writes so an older snapshot never lands last
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueShared {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.config.persist_path.as_deref() else {
            return Ok(());
        };

        let _write = self.write_lock.lock().await;
        let (operations, stats) = {
            let state = self.state.lock();
            let operations: Vec<QueuedOperation> =
                state.in_flight.iter().chain(state.items.iter()).cloned().collect();
            (operations, state.stats.clone())
        };

        persistence::save_queue(path, &operations, &stats).await?;
        debug!("Persisted {} queued operations", operations.len());
        Ok(())
    }
}

/// Resets the flushing flag however the flush ends
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bounded, deduplicating, persistent queue of pending writes
pub struct OfflineQueue {
    shared: Arc<QueueShared>,
    flushing: AtomicBool,
    debouncer: Debouncer,
}

impl OfflineQueue {
    /// Empty queue; nothing is read from disk
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let debouncer = Debouncer::new(config.persist_debounce);
        Self {
            shared: Arc::new(QueueShared {
                config,
                state: Mutex::new(QueueState::default()),
                write_lock: tokio::sync::Mutex::new(()),
                events,
            }),
            flushing: AtomicBool::new(false),
            debouncer,
        }
    }

    /// Queue restored from the configured file, if any
    pub async fn load(config: QueueConfig) -> Self {
        let queue = Self::new(config);
        queue.reload().await;
        queue
    }

    /// Replace the in-memory state with the file contents
    pub async fn reload(&self) {
        let Some(path) = self.shared.config.persist_path.clone() else {
            return;
        };
        let loaded = persistence::load_queue(&path).await;

        let mut state = self.shared.state.lock();
        let mut items = loaded.operations;

        // entries saved while a flush was running may share a fingerprint; newest wins
        items.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        let mut seen = std::collections::HashSet::new();
        items.retain(|op| seen.insert(op.key.clone()));
        items.sort_by_key(|op| op.order());

        state.next_sequence = items.iter().map(|op| op.sequence + 1).max().unwrap_or(0);
        state.items = items;
        state.in_flight.clear();
        state.stats = loaded.stats;

        while state.items.len() > self.shared.config.max_size {
            let Some(index) = state.eviction_candidate() else {
                break;
            };
            state.items.remove(index);
            state.stats.evicted += 1;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Add an operation, collapsing it into an existing entry with the same fingerprint
    pub fn enqueue(&self, operation: Operation) -> EnqueueOutcome {
        let kind = operation.kind();
        let key = operation.dedup_key();
        let max_size = self.shared.config.max_size;

        let (outcome, events) = {
            let mut state = self.shared.state.lock();

            if let Some(index) = state.items.iter().position(|op| op.key == key) {
                state.items[index].supersede(operation);
                state.stats.deduplicated += 1;
                (
                    EnqueueOutcome::Deduplicated,
                    vec![QueueEvent::Deduplicated { kind, key }],
                )
            } else {
                let mut events = Vec::new();
                let mut outcome = EnqueueOutcome::Added;

                if state.items.len() >= max_size {
                    let priority = operation.priority();
                    let victim = state
                        .eviction_candidate()
                        .filter(|&i| state.items[i].priority >= priority);

                    match victim {
                        Some(index) => {
                            let evicted = state.items.remove(index);
                            state.stats.evicted += 1;
                            warn!("Offline queue full, evicted {} ({})", evicted.kind(), evicted.key);
                            events.push(QueueEvent::Evicted {
                                kind: evicted.kind(),
                                key: evicted.key.clone(),
                            });
                            outcome = EnqueueOutcome::AddedWithEviction {
                                evicted_key: evicted.key,
                            };
                        }
                        None => {
                            state.stats.total_dropped += 1;
                            let reason = format!("queue full ({} entries of higher priority)", max_size);
                            warn!("Offline queue full, dropping {} ({})", kind, key);
                            drop(state);
                            self.shared.emit(QueueEvent::Dropped {
                                kind,
                                key,
                                reason: reason.clone(),
                            });
                            return EnqueueOutcome::Dropped { reason };
                        }
                    }
                }

                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state
                    .items
                    .push(QueuedOperation::new(operation, self.shared.config.max_retries, sequence));
                state.stats.total_enqueued += 1;
                events.push(QueueEvent::Enqueued {
                    kind,
                    key,
                    size: state.items.len() + state.in_flight.len(),
                });
                (outcome, events)
            }
        };

        for event in events {
            self.shared.emit(event);
        }
        self.schedule_persist();
        outcome
    }

    /// Remove and return the most urgent entry
    pub fn dequeue(&self) -> Option<QueuedOperation> {
        let op = {
            let mut state = self.shared.state.lock();
            let index = state.most_urgent()?;
            state.items.remove(index)
        };
        self.schedule_persist();
        Some(op)
    }

    /// Most urgent entry, left in place
    pub fn peek(&self) -> Option<QueuedOperation> {
        let state = self.shared.state.lock();
        state.most_urgent().map(|i| state.items[i].clone())
    }

    /// Pending entries, including those held by a running flush
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.items.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Drop every waiting entry; returns how many were removed
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.items.len();
            state.items.clear();
            removed
        };
        if removed > 0 {
            info!("Cleared {} queued operations", removed);
        }
        self.schedule_persist();
        removed
    }

    /// Waiting entries in flush order
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        let mut items = self.shared.state.lock().items.clone();
        items.sort_by_key(|op| op.order());
        items
    }

    pub fn stats(&self) -> QueueSnapshot {
        let state = self.shared.state.lock();
        QueueSnapshot {
            size: state.items.len() + state.in_flight.len(),
            max_size: self.shared.config.max_size,
            flushing: self.is_flushing(),
            stats: state.stats.clone(),
        }
    }

    /// Apply waiting entries in priority order, in batches.
    ///
    /// Validation failures are dropped at once. Other failures are retried on a
    /// later flush until `max_retries`. An open breaker stops the flush and keeps
    /// everything not yet attempted, without charging a retry.
    pub async fn flush<P>(&self, processor: &P) -> Result<FlushResult>
    where
        P: OperationProcessor + ?Sized,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::FlushInProgress.into());
        }
        let _guard = FlushGuard(&self.flushing);

        let pending = {
            let mut state = self.shared.state.lock();
            let mut items = std::mem::take(&mut state.items);
            items.sort_by_key(|op| op.order());
            state.in_flight = items.clone();
            items
        };

        let mut result = FlushResult::default();
        if pending.is_empty() {
            return Ok(result);
        }

        info!("Flushing {} queued operations", pending.len());

        let batch_size = self.shared.config.batch_size;
        let mut retry_later = Vec::new();
        let mut not_attempted = Vec::new();
        let mut dropped_events = Vec::new();
        let mut pending = pending.into_iter().peekable();
        let mut first_batch = true;

        'batches: while pending.peek().is_some() {
            if !first_batch && !self.shared.config.batch_delay.is_zero() {
                tokio::time::sleep(self.shared.config.batch_delay).await;
            }
            first_batch = false;

            let batch: Vec<QueuedOperation> = pending.by_ref().take(batch_size).collect();
            let mut batch = batch.into_iter();

            while let Some(mut op) = batch.next() {
                let op_id = op.id;
                let settled = match processor.process(&op.operation).await {
                    Ok(()) => {
                        result.processed += 1;
                        true
                    }
                    Err(e) if e.is_circuit_open() => {
                        warn!("Circuit open during flush, keeping remaining operations");
                        not_attempted.push(op);
                        not_attempted.extend(batch.by_ref());
                        not_attempted.extend(pending.by_ref());
                        break 'batches;
                    }
                    Err(e) if e.is_validation() => {
                        result.failed += 1;
                        result.dropped += 1;
                        warn!("Dropping invalid queued {}: {}", op.kind(), e);
                        dropped_events.push(QueueEvent::Dropped {
                            kind: op.kind(),
                            key: op.key.clone(),
                            reason: e.to_string(),
                        });
                        true
                    }
                    Err(e) => {
                        result.failed += 1;
                        op.retries += 1;
                        op.updated_at = Utc::now();
                        if op.retries >= op.max_retries {
                            result.dropped += 1;
                            warn!(
                                "Dropping queued {} after {} attempts: {}",
                                op.kind(),
                                op.retries,
                                e
                            );
                            dropped_events.push(QueueEvent::Dropped {
                                kind: op.kind(),
                                key: op.key.clone(),
                                reason: e.to_string(),
                            });
                            true
                        } else {
                            debug!("Queued {} failed (attempt {}): {}", op.kind(), op.retries, e);
                            retry_later.push(op);
                            false
                        }
                    }
                };

                // settled entries leave the saved snapshot; retries stay until re-queued
                if settled {
                    self.shared.state.lock().in_flight.retain(|f| f.id != op_id);
                }
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.in_flight.clear();

            for op in not_attempted.into_iter().chain(retry_later) {
                // anything enqueued meanwhile for the same records is newer
                if state.items.iter().any(|existing| existing.key == op.key) {
                    state.stats.deduplicated += 1;
                    continue;
                }
                state.items.push(op);
            }

            while state.items.len() > self.shared.config.max_size {
                match state.eviction_candidate() {
                    Some(index) => {
                        let evicted = state.items.remove(index);
                        state.stats.evicted += 1;
                        dropped_events.push(QueueEvent::Evicted {
                            kind: evicted.kind(),
                            key: evicted.key,
                        });
                    }
                    None => break,
                }
            }

            state.stats.total_processed += result.processed as u64;
            state.stats.total_failed += result.failed as u64;
            state.stats.total_dropped += result.dropped as u64;
            state.stats.flushes += 1;
            state.stats.last_flush_at = Some(Utc::now());
            result.remaining = state.items.len();
        }

        for event in dropped_events {
            self.shared.emit(event);
        }

        self.debouncer.cancel();
        if let Err(e) = self.shared.persist().await {
            warn!("Failed to persist queue after flush: {}", e);
        }

        info!(
            "Flush complete: {} processed, {} failed, {} dropped, {} remaining",
            result.processed, result.failed, result.dropped, result.remaining
        );
        self.shared.emit(QueueEvent::Flushed(result.clone()));
        Ok(result)
    }

    /// Save immediately, superseding any pending debounced save
    pub async fn persist_now(&self) -> Result<()> {
        self.debouncer.cancel();
        self.shared.persist().await
    }

    /// Final save; the queue stays usable afterwards
    pub async fn shutdown(&self) -> Result<()> {
        self.persist_now().await
    }

    fn schedule_persist(&self) {
        if self.shared.config.persist_path.is_none() {
            return;
        }
        let shared = self.shared.clone();
        self.debouncer.schedule(move || async move {
            if let Err(e) = shared.persist().await {
                warn!("Failed to persist offline queue: {}", e);
            }
        });
    }
}
