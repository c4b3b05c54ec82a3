//! # Decision History
//!
//! Bounded memory of final decisions, consulted for spans that arrive after
//! their trace was decided. Backed by a 2Q cache: ids seen once live in a
//! small recent queue, ids looked up again are promoted to a frequent queue,
//! and ids evicted from the recent queue are remembered in a ghost queue so
//! a quick return goes straight to the frequent queue.
use crate::error::{CascadingFilterError, CascadingFilterResult};
use crate::sampling::Decision;
use opentelemetry::trace::TraceId;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

const RECENT_RATIO: f64 = 0.25;
const GHOST_RATIO: f64 = 0.50;

/// What was decided about a trace.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DecisionHistoryInfo {
    pub(crate) final_decision: Decision,
    pub(crate) filter_name: Option<String>,
    pub(crate) probabilistic_filter: bool,
}

/// Thread safe wrapper around a [`TwoQueueCache`] of decisions.
#[derive(Debug)]
pub(crate) struct DecisionHistory {
    cache: Mutex<TwoQueueCache<TraceId, DecisionHistoryInfo>>,
}

impl DecisionHistory {
    pub(crate) fn new(size: u64) -> CascadingFilterResult<Self> {
        Ok(DecisionHistory {
            cache: Mutex::new(TwoQueueCache::new(size as usize)?),
        })
    }

    pub(crate) fn get(&self, id: &TraceId) -> Option<DecisionHistoryInfo> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
    }

    pub(crate) fn add(&self, id: TraceId, info: DecisionHistoryInfo) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(id, info);
    }
}

// least recently used list, oldest entry has the lowest stamp
#[derive(Debug)]
struct LruList<K, V> {
    capacity: usize,
    next_stamp: u64,
    entries: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
}

impl<K: Clone + Eq + Hash, V> LruList<K, V> {
    fn new(capacity: usize) -> Self {
        LruList {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Inserts or refreshes `key`, evicting the oldest entry past capacity.
    fn add(&mut self, key: K, value: V) {
        let stamp = self.stamp();
        if let Some((old_stamp, _)) = self.entries.insert(key.clone(), (stamp, value)) {
            self.order.remove(&old_stamp);
        }
        self.order.insert(stamp, key);
        if self.entries.len() > self.capacity {
            self.remove_oldest();
        }
    }

    /// Looks up `key` and marks it as most recently used.
    fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.stamp();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.0);
        self.order.insert(stamp, key.clone());
        entry.0 = stamp;
        Some(&entry.1)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let (stamp, value) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    fn remove_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let (_, value) = self.entries.remove(&key)?;
        Some((key, value))
    }
}

/// Fixed size 2Q cache.
#[derive(Debug)]
pub(crate) struct TwoQueueCache<K, V> {
    size: usize,
    recent_size: usize,
    recent: LruList<K, V>,
    frequent: LruList<K, V>,
    recent_evict: LruList<K, ()>,
}

impl<K: Clone + Eq + Hash, V: Clone> TwoQueueCache<K, V> {
    pub(crate) fn new(size: usize) -> CascadingFilterResult<Self> {
        if size == 0 {
            return Err(CascadingFilterError::InvalidHistorySize);
        }
        let recent_size = (size as f64 * RECENT_RATIO) as usize;
        let evict_size = ((size as f64 * GHOST_RATIO) as usize).max(1);

        Ok(TwoQueueCache {
            size,
            recent_size,
            recent: LruList::new(size),
            frequent: LruList::new(size),
            recent_evict: LruList::new(evict_size),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }

    /// Looks up `key`, promoting it to the frequent queue.
    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.frequent.get(key) {
            return Some(value.clone());
        }
        let value = self.recent.remove(key)?;
        self.frequent.add(key.clone(), value.clone());
        Some(value)
    }

    pub(crate) fn add(&mut self, key: K, value: V) {
        if self.frequent.contains(&key) {
            self.frequent.add(key, value);
            return;
        }

        if self.recent.remove(&key).is_some() {
            self.frequent.add(key, value);
            return;
        }

        if self.recent_evict.contains(&key) {
            self.ensure_space(true);
            self.recent_evict.remove(&key);
            self.frequent.add(key, value);
            return;
        }

        self.ensure_space(false);
        self.recent.add(key, value);
    }

    fn ensure_space(&mut self, recent_evict: bool) {
        let recent_len = self.recent.len();
        if recent_len + self.frequent.len() < self.size {
            return;
        }

        if recent_len > 0
            && (recent_len > self.recent_size || (recent_len == self.recent_size && !recent_evict))
        {
            if let Some((key, _)) = self.recent.remove_oldest() {
                self.recent_evict.add(key, ());
            }
            return;
        }

        self.frequent.remove_oldest();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled(name: &str) -> DecisionHistoryInfo {
        DecisionHistoryInfo {
            final_decision: Decision::Sampled,
            filter_name: Some(name.to_string()),
            probabilistic_filter: false,
        }
    }

    #[test]
    fn zero_size_is_invalid() {
        assert!(matches!(
            TwoQueueCache::<u32, u32>::new(0),
            Err(CascadingFilterError::InvalidHistorySize)
        ));
    }

    #[test]
    fn never_holds_more_than_size() {
        let mut cache = TwoQueueCache::new(128).unwrap();
        for i in 0..256u32 {
            cache.add(i, i);
        }
        assert_eq!(cache.len(), 128);
        assert!(cache.get(&0).is_none());
        assert_eq!(cache.get(&255), Some(255));
    }

    #[test]
    fn get_promotes_to_frequent() {
        let mut cache = TwoQueueCache::new(4).unwrap();
        cache.add(1, "a");
        assert_eq!(cache.get(&1), Some("a"));
        assert!(cache.frequent.contains(&1));
        assert!(!cache.recent.contains(&1));

        // recent churn does not push out the frequently used entry
        for i in 2..20 {
            cache.add(i, "b");
        }
        assert_eq!(cache.get(&1), Some("a"));
    }

    #[test]
    fn evicted_recent_entries_become_ghosts() {
        let mut cache = TwoQueueCache::new(4).unwrap();
        for i in 0..5u32 {
            cache.add(i, i);
        }
        assert!(cache.recent_evict.contains(&0));
        assert!(cache.get(&0).is_none());

        // a ghost hit goes straight to the frequent queue
        cache.add(0, 100);
        assert!(cache.frequent.contains(&0));
        assert!(!cache.recent_evict.contains(&0));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn add_updates_existing_value() {
        let mut cache = TwoQueueCache::new(8).unwrap();
        cache.add(7, 1);
        cache.add(7, 2);
        assert_eq!(cache.get(&7), Some(2));
        cache.add(7, 3);
        assert_eq!(cache.get(&7), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn history_of_trace_ids() {
        let history = DecisionHistory::new(10).unwrap();
        let id = TraceId::from_bytes([3; 16]);
        assert!(history.get(&id).is_none());

        history.add(id, sampled("errors"));
        assert_eq!(history.get(&id), Some(sampled("errors")));
    }

    #[test]
    fn single_entry_history() {
        let history = DecisionHistory::new(1).unwrap();
        let first = TraceId::from_bytes([1; 16]);
        let second = TraceId::from_bytes([2; 16]);
        history.add(first, sampled("a"));
        history.add(second, sampled("b"));
        assert!(history.get(&first).is_none());
        assert_eq!(history.get(&second), Some(sampled("b")));
    }
}
