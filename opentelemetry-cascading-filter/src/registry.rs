use crate::error::{CascadingFilterError, CascadingFilterResult};
use crate::sampling::TraceData;
use opentelemetry::otel_debug;
use opentelemetry::trace::TraceId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const SHARD_COUNT: usize = 64;

type Shard = RwLock<HashMap<TraceId, Arc<TraceData>>>;

/// Traces waiting for a decision, keyed by trace id.
///
/// The map is split into shards picked by the low bits of the trace id so
/// ingestion threads working on different traces rarely contend. At most
/// `max_num_traces` traces are admitted: every new trace id is queued, and
/// once the queue is full the oldest queued id is evicted to make room.
/// Ids of traces that were already decided stay queued until they are
/// popped, so the bound is approximate and eviction is first in, first out.
#[derive(Debug)]
pub(crate) struct TraceRegistry {
    shards: Box<[Shard]>,
    num_traces: AtomicU64,
    delete_queue: Mutex<VecDeque<TraceId>>,
    max_num_traces: usize,
}

impl TraceRegistry {
    pub(crate) fn new(max_num_traces: u64) -> CascadingFilterResult<Self> {
        if max_num_traces == 0 {
            return Err(CascadingFilterError::InvalidNumTraces);
        }
        Ok(TraceRegistry {
            shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
            num_traces: AtomicU64::new(0),
            delete_queue: Mutex::new(VecDeque::new()),
            max_num_traces: max_num_traces as usize,
        })
    }

    fn shard(&self, id: &TraceId) -> &Shard {
        let low_bits = u128::from_be_bytes(id.to_bytes()) as usize;
        &self.shards[low_bits % SHARD_COUNT]
    }

    /// Returns the trace stored under `id`, inserting the one built by
    /// `make` if there is none. The flag is `true` when the trace was
    /// already present.
    pub(crate) fn load_or_store(
        &self,
        id: TraceId,
        make: impl FnOnce() -> TraceData,
    ) -> (Arc<TraceData>, bool) {
        let shard = self.shard(&id);
        if let Some(trace) = shard.read().unwrap_or_else(PoisonError::into_inner).get(&id) {
            return (trace.clone(), true);
        }

        let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(trace) = map.get(&id) {
            return (trace.clone(), true);
        }
        let trace = Arc::new(make());
        map.insert(id, trace.clone());
        self.num_traces.fetch_add(1, Ordering::Relaxed);
        (trace, false)
    }

    pub(crate) fn get(&self, id: &TraceId) -> Option<Arc<TraceData>> {
        self.shard(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Removes the trace, if it is still present.
    pub(crate) fn remove(&self, id: &TraceId) -> Option<Arc<TraceData>> {
        let removed = self
            .shard(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(_) => {
                self.num_traces.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                otel_debug!(
                    name: "CascadingFilter.Registry.RemoveMissing",
                    trace_id = format!("{}", id)
                );
            }
        }
        removed
    }

    /// Queues a newly stored trace id, evicting the oldest queued traces
    /// while the queue is full.
    pub(crate) fn enqueue_for_eviction(&self, id: TraceId) {
        let evicted: Vec<TraceId> = {
            let mut queue = self
                .delete_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut evicted = Vec::new();
            while queue.len() >= self.max_num_traces {
                match queue.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            queue.push_back(id);
            evicted
        };

        for oldest in evicted {
            self.remove(&oldest);
        }
    }

    /// Number of traces currently stored.
    pub(crate) fn len(&self) -> u64 {
        self.num_traces.load(Ordering::Relaxed)
    }
}
