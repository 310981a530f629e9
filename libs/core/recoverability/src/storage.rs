//! Process-local failure bookkeeping shared by the recoverability stages.

use crate::error::PipelineError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default number of message ids tracked at once.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Snapshot of what is known about the failures of one message id.
#[derive(Debug, Clone)]
pub struct ProcessingFailureInfo {
    pub number_of_failed_attempts: u32,
    pub exception: Option<PipelineError>,
    pub should_move_to_error_queue: bool,
    pub should_defer_for_retry: bool,
}

impl ProcessingFailureInfo {
    /// Returned when nothing is recorded for a message id.
    pub const NULL: Self = Self {
        number_of_failed_attempts: 0,
        exception: None,
        should_move_to_error_queue: false,
        should_defer_for_retry: false,
    };

    pub fn is_null(&self) -> bool {
        self.number_of_failed_attempts == 0 && self.exception.is_none()
    }
}

impl Default for ProcessingFailureInfo {
    fn default() -> Self {
        Self::NULL
    }
}

#[derive(Debug)]
struct FailureRecord {
    info: ProcessingFailureInfo,
    touched: u64,
}

/// Concurrent map from message id to its current failure record.
///
/// Per-id updates are atomic (the shard holding the key is locked for the
/// read-modify-write); unrelated ids do not contend on a global lock. The
/// map is bounded: once `capacity` ids are tracked, recording a failure for
/// a new id evicts the least recently touched one.
#[derive(Debug)]
pub struct FailureInfoStorage {
    records: DashMap<String, FailureRecord>,
    capacity: usize,
    clock: AtomicU64,
}

impl Default for FailureInfoStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureInfoStorage {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Current record for `message_id`, or [`ProcessingFailureInfo::NULL`].
    pub fn get_failure_info(&self, message_id: &str) -> ProcessingFailureInfo {
        self.records
            .get(message_id)
            .map(|record| record.info.clone())
            .unwrap_or(ProcessingFailureInfo::NULL)
    }

    /// Count one more failure for `message_id` and replace the stored flags.
    pub fn record_failure(
        &self,
        message_id: &str,
        exception: PipelineError,
        should_move_to_error_queue: bool,
        should_defer_for_retry: bool,
    ) {
        let touched = self.clock.fetch_add(1, Ordering::Relaxed);

        let inserted = match self.records.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.info.number_of_failed_attempts += 1;
                record.info.exception = Some(exception);
                record.info.should_move_to_error_queue = should_move_to_error_queue;
                record.info.should_defer_for_retry = should_defer_for_retry;
                record.touched = touched;
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(FailureRecord {
                    info: ProcessingFailureInfo {
                        number_of_failed_attempts: 1,
                        exception: Some(exception),
                        should_move_to_error_queue,
                        should_defer_for_retry,
                    },
                    touched,
                });
                true
            }
        };

        if inserted {
            self.evict_over_capacity(message_id);
        }
    }

    /// Forget everything about `message_id`. No-op when nothing is stored.
    pub fn clear_failure_info(&self, message_id: &str) {
        self.records.remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evict_over_capacity(&self, keep: &str) {
        while self.records.len() > self.capacity {
            let oldest = self
                .records
                .iter()
                .filter(|record| record.key() != keep)
                .min_by_key(|record| record.value().touched)
                .map(|record| record.key().clone());

            let Some(oldest) = oldest else {
                return;
            };
            debug!(message_id = %oldest, capacity = self.capacity, "Evicting failure record");
            self.records.remove(&oldest);
        }
    }
}
