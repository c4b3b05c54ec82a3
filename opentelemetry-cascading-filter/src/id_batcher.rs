//! # ID Batcher
//!
//! Trace ids are collected into the batch that is current when their first
//! span arrives. Every tick closes the current batch and hands out the oldest
//! one, so an id is evaluated roughly `num_batches` ticks after it was added.
use crate::error::{CascadingFilterError, CascadingFilterResult};
use opentelemetry::trace::TraceId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

// upper bound on the ids reserved up front per batch
const MAX_BATCH_CAPACITY: usize = 1 << 16;

/// A batch of trace ids.
pub(crate) type Batch = Vec<TraceId>;

/// Groups trace ids into time windowed batches.
pub(crate) trait Batcher: Send + Sync {
    /// Adds an id to the current batch. Safe to call from many threads.
    fn add_to_current_batch(&self, id: TraceId);

    /// Closes the current batch, queues it and returns the oldest batch.
    ///
    /// The flag is `false` once the batcher is stopped and every queued batch
    /// was handed out; the returned batch then holds the ids added since the
    /// last close.
    fn close_current_and_take_first_batch(&self) -> (Batch, bool);

    /// Stops rotating batches. Queued batches can still be drained.
    fn stop(&self);
}

/// Ring of `num_batches` batches, oldest first.
#[derive(Debug)]
pub(crate) struct IdBatcher {
    // lock order: batches, then current
    batches: Mutex<VecDeque<Batch>>,
    current: Mutex<Batch>,
    new_batch_capacity: usize,
    stopped: AtomicBool,
}

impl IdBatcher {
    /// Creates a batcher whose ring is prefilled with `num_batches` empty
    /// batches. New batches reserve room for `new_batch_capacity` ids, up
    /// to `MAX_BATCH_CAPACITY`.
    pub(crate) fn new(num_batches: u64, new_batch_capacity: u64) -> CascadingFilterResult<Self> {
        if num_batches == 0 {
            return Err(CascadingFilterError::InvalidNumBatches);
        }
        let new_batch_capacity =
            usize::try_from(new_batch_capacity).map_or(MAX_BATCH_CAPACITY, |capacity| {
                capacity.min(MAX_BATCH_CAPACITY)
            });
        let batches = (0..num_batches)
            .map(|_| Batch::with_capacity(new_batch_capacity))
            .collect();

        Ok(IdBatcher {
            batches: Mutex::new(batches),
            current: Mutex::new(Batch::with_capacity(new_batch_capacity)),
            new_batch_capacity,
            stopped: AtomicBool::new(false),
        })
    }
}

impl Batcher for IdBatcher {
    fn add_to_current_batch(&self, id: TraceId) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    fn close_current_and_take_first_batch(&self) -> (Batch, bool) {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        match batches.pop_front() {
            Some(first) => {
                if !self.stopped.load(Ordering::Acquire) {
                    let next = Batch::with_capacity(self.new_batch_capacity);
                    batches.push_back(std::mem::replace(&mut *current, next));
                }
                (first, true)
            }
            None => (std::mem::take(&mut *current), false),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
