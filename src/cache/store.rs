use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::entry::CacheEntry;
use super::list::RecencyList;

/// Which resource the capacity budget counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityMode {
    /// `capacity` is a maximum number of resident entries.
    Entries,
    /// `capacity` is a byte budget; each entry is charged its precomputed size.
    Bytes,
}

impl fmt::Display for CapacityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityMode::Entries => write!(f, "entries"),
            CapacityMode::Bytes => write!(f, "bytes"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The entry alone exceeds the whole cache budget. The insertion loop has
    /// already emptied the store by the time this is returned.
    #[error("cache entry cost {cost} exceeds the total cache capacity of {capacity} {mode}")]
    EntryTooLarge {
        cost: u64,
        capacity: u64,
        mode: CapacityMode,
    },
}

struct Slot {
    entry: CacheEntry,
    node: usize,
}

struct StoreInner {
    index: HashMap<Arc<str>, Slot>,
    list: RecencyList,
    used: u64,
}

/// Thread-safe LRU store over captured responses.
///
/// One mutex covers the key index, the recency list, and the usage counter;
/// every public operation takes it for the whole operation, so per-key
/// behavior is linearizable. All work under the lock is O(1) bookkeeping per
/// touched entry; callers perform network I/O outside the lock.
pub struct LruStore {
    inner: Mutex<StoreInner>,
    capacity: u64,
    mode: CapacityMode,
}

impl LruStore {
    pub fn new(capacity: u64, mode: CapacityMode) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                index: HashMap::new(),
                list: RecencyList::new(),
                used: 0,
            }),
            capacity,
            mode,
        }
    }

    /// Looks up a key and promotes it to most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.index.get(key)?;
        let node = slot.node;
        let entry = slot.entry.clone();
        inner.list.move_to_front(node);
        Some(entry)
    }

    /// Inserts or replaces an entry, then evicts from the tail until usage is
    /// back within capacity. Returns the number of entries evicted.
    ///
    /// An entry whose cost alone exceeds the capacity is rejected with
    /// [`StoreError::EntryTooLarge`] after the eviction loop has run, leaving
    /// the store empty rather than resident-but-over-budget.
    pub fn set(&self, key: &str, entry: CacheEntry) -> Result<usize, StoreError> {
        let cost = self.cost(&entry);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(slot) = inner.index.get_mut(key) {
            let old_cost = match self.mode {
                CapacityMode::Entries => 1,
                CapacityMode::Bytes => slot.entry.size(),
            };
            let node = slot.node;
            slot.entry = entry;
            inner.used = inner.used - old_cost + cost;
            inner.list.move_to_front(node);
        } else {
            let shared: Arc<str> = Arc::from(key);
            let node = inner.list.push_front(shared.clone());
            inner.index.insert(shared, Slot { entry, node });
            inner.used += cost;
        }

        let mut evicted = 0;
        while inner.used > self.capacity {
            let victim = match inner.list.back() {
                Some(victim) => victim.clone(),
                None => break,
            };
            if victim.as_ref() == key {
                // Only the fresh entry remains and it still exceeds the
                // budget on its own.
                self.remove_locked(inner, &victim);
                return Err(StoreError::EntryTooLarge {
                    cost,
                    capacity: self.capacity,
                    mode: self.mode,
                });
            }
            self.remove_locked(inner, &victim);
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Removes the given keys; missing keys are ignored. Returns the count
    /// actually removed.
    pub fn delete<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut removed = 0;
        for key in keys {
            if self.remove_locked(inner, key.as_ref()).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot of resident keys in MRU to LRU order.
    pub fn keys(&self) -> Vec<String> {
        let guard = self.inner.lock();
        guard.list.iter().map(|key| key.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used(&self) -> u64 {
        self.inner.lock().used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn mode(&self) -> CapacityMode {
        self.mode
    }

    fn cost(&self, entry: &CacheEntry) -> u64 {
        match self.mode {
            CapacityMode::Entries => 1,
            CapacityMode::Bytes => entry.size(),
        }
    }

    fn remove_locked(&self, inner: &mut StoreInner, key: &str) -> Option<CacheEntry> {
        let slot = inner.index.remove(key)?;
        inner.list.unlink(slot.node);
        let cost = match self.mode {
            CapacityMode::Entries => 1,
            CapacityMode::Bytes => slot.entry.size(),
        };
        inner.used -= cost;
        Some(slot.entry)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        use std::collections::HashSet;

        let guard = self.inner.lock();
        assert_eq!(guard.index.len(), guard.list.len(), "index/list length drift");

        let listed: Vec<String> = guard.list.iter().map(|key| key.to_string()).collect();
        let unique: HashSet<&String> = listed.iter().collect();
        assert_eq!(unique.len(), listed.len(), "duplicate key in recency list");
        for key in &listed {
            assert!(
                guard.index.contains_key(key.as_str()),
                "listed key {key} missing from index"
            );
        }

        let expected = match self.mode {
            CapacityMode::Entries => guard.index.len() as u64,
            CapacityMode::Bytes => guard.index.values().map(|slot| slot.entry.size()).sum(),
        };
        assert_eq!(guard.used, expected, "usage counter drift");
        assert!(guard.used <= self.capacity, "usage exceeds capacity at rest");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn entry() -> CacheEntry {
        CacheEntry::from_upstream(StatusCode::OK, &HeaderMap::new(), Bytes::from_static(b"body"))
    }

    /// Builds an entry whose total cost is exactly `size` bytes.
    fn entry_of_size(size: u64) -> CacheEntry {
        let base = CacheEntry::from_upstream(StatusCode::OK, &HeaderMap::new(), Bytes::new()).size();
        assert!(size >= base, "requested size smaller than fixed entry cost");
        let body = vec![b'x'; (size - base) as usize];
        let entry = CacheEntry::from_upstream(StatusCode::OK, &HeaderMap::new(), Bytes::from(body));
        assert_eq!(entry.size(), size);
        entry
    }

    #[test]
    fn get_miss_returns_none() {
        let store = LruStore::new(4, CapacityMode::Entries);
        assert!(store.get("GET:/missing").is_none());
        store.check_invariants();
    }

    #[test]
    fn set_then_get_returns_the_entry() {
        let store = LruStore::new(4, CapacityMode::Entries);
        store.set("GET:/a", entry()).unwrap();
        let found = store.get("GET:/a").expect("entry should be resident");
        assert_eq!(found.body().as_ref(), b"body");
        store.check_invariants();
    }

    #[test]
    fn get_promotes_against_eviction() {
        // Set a, set b, touch a, set c with capacity 2: a and c survive.
        let store = LruStore::new(2, CapacityMode::Entries);
        store.set("GET:/a", entry()).unwrap();
        store.set("GET:/b", entry()).unwrap();
        assert!(store.get("GET:/a").is_some());
        let evicted = store.set("GET:/c", entry()).unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get("GET:/a").is_some());
        assert!(store.get("GET:/c").is_some());
        assert!(store.get("GET:/b").is_none());
        store.check_invariants();
    }

    #[test]
    fn eviction_follows_strict_lru_order() {
        let store = LruStore::new(2, CapacityMode::Entries);
        store.set("GET:/1", entry()).unwrap();
        store.set("GET:/2", entry()).unwrap();
        assert!(store.get("GET:/1").is_some());
        store.set("GET:/3", entry()).unwrap();
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["GET:/1", "GET:/3"]);
        store.check_invariants();
    }

    #[test]
    fn keys_are_ordered_most_recent_first() {
        let store = LruStore::new(4, CapacityMode::Entries);
        store.set("GET:/a", entry()).unwrap();
        store.set("GET:/b", entry()).unwrap();
        store.set("GET:/c", entry()).unwrap();
        store.get("GET:/a");
        assert_eq!(store.keys(), vec!["GET:/a", "GET:/c", "GET:/b"]);
    }

    #[test]
    fn memory_mode_charges_entry_sizes() {
        let store = LruStore::new(100, CapacityMode::Bytes);
        store.set("GET:/first", entry_of_size(60)).unwrap();
        assert_eq!(store.used(), 60);
        let evicted = store.set("GET:/second", entry_of_size(50)).unwrap();
        assert_eq!(evicted, 1, "the first entry no longer fits");
        assert_eq!(store.used(), 50);
        assert!(store.get("GET:/first").is_none());
        assert!(store.get("GET:/second").is_some());
        store.check_invariants();
    }

    #[test]
    fn replacing_an_entry_adjusts_usage_in_place() {
        let store = LruStore::new(100, CapacityMode::Bytes);
        store.set("GET:/a", entry_of_size(40)).unwrap();
        store.set("GET:/a", entry_of_size(70)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.used(), 70);
        store.check_invariants();
    }

    #[test]
    fn oversized_entry_is_rejected_after_clearing_the_store() {
        let store = LruStore::new(100, CapacityMode::Bytes);
        store.set("GET:/a", entry_of_size(40)).unwrap();
        store.set("GET:/b", entry_of_size(40)).unwrap();

        let err = store
            .set("GET:/huge", entry_of_size(200))
            .expect_err("oversized entry must be rejected");
        assert!(matches!(err, StoreError::EntryTooLarge { cost: 200, .. }));
        assert!(store.is_empty(), "insertion loop evicts everything first");
        assert_eq!(store.used(), 0);
        assert!(store.get("GET:/huge").is_none());
        store.check_invariants();
    }

    #[test]
    fn entry_mode_with_zero_capacity_rejects_everything() {
        let store = LruStore::new(0, CapacityMode::Entries);
        let err = store.set("GET:/a", entry()).expect_err("zero capacity");
        assert!(matches!(err, StoreError::EntryTooLarge { cost: 1, .. }));
        assert!(store.is_empty());
        store.check_invariants();
    }

    #[test]
    fn oversized_replacement_clears_the_store() {
        let store = LruStore::new(100, CapacityMode::Bytes);
        store.set("GET:/a", entry_of_size(40)).unwrap();
        store.set("GET:/b", entry_of_size(40)).unwrap();
        let err = store
            .set("GET:/a", entry_of_size(150))
            .expect_err("replacement exceeding capacity must be rejected");
        assert!(matches!(err, StoreError::EntryTooLarge { .. }));
        assert!(store.is_empty());
        store.check_invariants();
    }

    #[test]
    fn delete_counts_only_resident_keys() {
        let store = LruStore::new(4, CapacityMode::Entries);
        store.set("GET:/a", entry()).unwrap();
        store.set("GET:/b", entry()).unwrap();
        let removed = store.delete(["GET:/a", "GET:/missing", "GET:/b"]);
        assert_eq!(removed, 2);
        assert!(store.is_empty());
        store.check_invariants();
    }

    #[test]
    fn invariants_hold_across_mixed_operations() {
        let store = LruStore::new(120, CapacityMode::Bytes);
        for round in 0u64..40 {
            let key = format!("GET:/items/{}", round % 7);
            match round % 4 {
                0 | 1 => {
                    let _ = store.set(&key, entry_of_size(20 + (round % 5) * 10));
                }
                2 => {
                    store.get(&key);
                }
                _ => {
                    store.delete([key.as_str()]);
                }
            }
            store.check_invariants();
        }
    }

    #[test]
    fn concurrent_readers_and_writers_keep_the_store_consistent() {
        let store = std::sync::Arc::new(LruStore::new(16, CapacityMode::Entries));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..200 {
                    let key = format!("GET:/w{}/{}", worker, round % 10);
                    match round % 3 {
                        0 => {
                            let _ = store.set(&key, entry());
                        }
                        1 => {
                            store.get(&key);
                        }
                        _ => {
                            store.delete([key.as_str()]);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        store.check_invariants();
    }
}
