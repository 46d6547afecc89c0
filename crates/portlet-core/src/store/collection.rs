// ── Generic reactive record collection ──
//
// Concurrent keyed storage with O(1) lookups and push-based snapshot
// notification via a `watch` channel. Records are immutable `Arc`s:
// writers swap a whole value in, readers never see a partial write.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

/// Stored value plus its insertion rank, which fixes snapshot order.
struct Slot<V> {
    rank: u64,
    value: Arc<V>,
}

/// A lock-free, reactive collection for a single record type.
///
/// Snapshots list records in first-insertion order. Re-upserting an
/// existing key keeps its position.
pub(crate) struct RecordCollection<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    by_key: DashMap<K, Slot<V>>,
    next_rank: AtomicU64,
    snapshot: watch::Sender<Arc<Vec<Arc<V>>>>,
}

impl<K, V> RecordCollection<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_key: DashMap::new(),
            next_rank: AtomicU64::new(0),
            snapshot,
        }
    }

    /// Insert or replace a record. Returns the stored `Arc` and whether
    /// the key was new.
    pub(crate) fn upsert(&self, key: K, value: V) -> (Arc<V>, bool) {
        let value = Arc::new(value);
        let is_new = match self.by_key.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().value = Arc::clone(&value);
                false
            }
            Entry::Vacant(entry) => {
                let rank = self.next_rank.fetch_add(1, Ordering::Relaxed);
                entry.insert(Slot {
                    rank,
                    value: Arc::clone(&value),
                });
                true
            }
        };
        self.rebuild_snapshot();
        (value, is_new)
    }

    /// Atomically replace an existing record with `f(current)`.
    ///
    /// `f` runs under the entry's shard lock; returning `None` leaves the
    /// record untouched. Returns the new value if one was written.
    pub(crate) fn modify(&self, key: &K, f: impl FnOnce(&V) -> Option<V>) -> Option<Arc<V>> {
        let written = {
            let mut slot = self.by_key.get_mut(key)?;
            let next = Arc::new(f(slot.value.as_ref())?);
            slot.value = Arc::clone(&next);
            next
        };
        self.rebuild_snapshot();
        Some(written)
    }

    /// Remove a record by key. Returns the removed record if it existed.
    pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
        let removed = self.by_key.remove(key).map(|(_, slot)| slot.value);
        if removed.is_some() {
            self.rebuild_snapshot();
        }
        removed
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.by_key.get(key).map(|slot| Arc::clone(&slot.value))
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<V>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<V>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Rebuild the ordered snapshot and hand it to subscribers.
    ///
    /// The map is read inside `send_modify` so that the last writer to
    /// take the watch lock always publishes a view containing every
    /// completed write, including concurrent ones.
    fn rebuild_snapshot(&self) {
        self.snapshot.send_modify(|snap| {
            let mut ranked: Vec<(u64, Arc<V>)> = self
                .by_key
                .iter()
                .map(|r| (r.rank, Arc::clone(&r.value)))
                .collect();
            ranked.sort_unstable_by_key(|(rank, _)| *rank);
            *snap = Arc::new(ranked.into_iter().map(|(_, v)| v).collect());
        });
    }
}
