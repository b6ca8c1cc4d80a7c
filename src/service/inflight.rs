//! Deduplication of identical reads that are already on the wire

use crate::error::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;

type SharedRead<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Flight<T: Clone> {
    /// Cache generation the read started under
    generation: u64,
    read: SharedRead<T>,
}

/// Identical concurrent reads share one remote call.
///
/// A read is only joined by callers that saw the same cache generation, so a
/// caller that arrives after an invalidation starts its own call. Bounded:
/// when full, the oldest entry stops being shareable (its waiters still get
/// their result).
pub struct InflightQueries<T: Clone> {
    max_entries: usize,
    entries: Mutex<IndexMap<String, Flight<T>>>,
}

impl<T> InflightQueries<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Join the read in flight for `key` started under `generation`, or
    /// start one with `start`
    pub async fn run<F>(&self, key: &str, generation: u64, start: F) -> Result<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        let read = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(existing) if existing.generation == generation => existing.read.clone(),
                _ => {
                    let read = start().shared();
                    // an older flight under this key is replaced in place
                    if !entries.contains_key(key) && entries.len() >= self.max_entries {
                        entries.shift_remove_index(0);
                    }
                    entries.insert(
                        key.to_string(),
                        Flight {
                            generation,
                            read: read.clone(),
                        },
                    );
                    read
                }
            }
        };

        let result = read.clone().await;

        let mut entries = self.entries.lock();
        if entries.get(key).map(|e| e.read.ptr_eq(&read)).unwrap_or(false) {
            entries.shift_remove(key);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
