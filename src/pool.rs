//! KVPool: the in-memory write buffer drained by `sync`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A concurrent staging map from on-disk key to pending payload.
///
/// Entries are created by `set` (and by n-gram index maintenance during
/// `set`), consulted first by every read, and drained unconditionally by
/// `sync`. It is not durable: a crash loses its contents, exactly like
/// `Bitcask`'s in-memory index is rebuilt from the log on open, except this
/// buffer has no on-disk log of its own to rebuild from.
///
/// `remove` acts on shards directly (see `engine.rs`), but it must also be
/// able to cancel a pending entry here — otherwise a key staged by `set`
/// and removed before its next `sync` would resurrect its stale value (and
/// a staged posting-list membership would resurrect a deleted key into a
/// wildcard index). [`KvPool::remove`] and [`KvPool::update_or_remove`]
/// exist for exactly that.
#[derive(Default)]
pub struct KvPool {
    entries: DashMap<String, String>,
}

impl KvPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `value` under `ondisk_key`, overwriting any pending value.
    pub fn stage(&self, ondisk_key: String, value: String) {
        self.entries.insert(ondisk_key, value);
    }

    /// Looks up a pending value by on-disk key.
    pub fn get(&self, ondisk_key: &str) -> Option<String> {
        self.entries.get(ondisk_key).map(|v| v.clone())
    }

    /// Drops any pending entry for `ondisk_key`, if present. A no-op if
    /// nothing is staged. Used by `remove` to stop an earlier, not-yet-
    /// synced `set` from writing a deleted key's stale value back at the
    /// next `sync`.
    pub fn remove(&self, ondisk_key: &str) {
        self.entries.remove(ondisk_key);
    }

    /// Atomically updates the pending payload for `ondisk_key` via `f`,
    /// which receives the current pending payload (`None` if nothing is
    /// staged). Returning `Some(new)` stages `new` as the pending payload;
    /// returning `None` drops the pending entry entirely.
    ///
    /// Used by posting-list maintenance during `remove`: purging a member
    /// from an as-yet-unsynced posting list must edit the pool's own
    /// pending copy in place, not just the persisted shard, or `sync`
    /// resurrects the stale membership (spec.md §8's "no-ghost index"
    /// invariant must hold even before the next `sync`).
    pub fn update_or_remove<F>(&self, ondisk_key: &str, f: F)
    where
        F: FnOnce(Option<&str>) -> Option<String>,
    {
        match self.entries.entry(ondisk_key.to_string()) {
            Entry::Occupied(mut e) => match f(Some(e.get().as_str())) {
                Some(new_value) => {
                    e.insert(new_value);
                }
                None => {
                    e.remove();
                }
            },
            Entry::Vacant(e) => {
                if let Some(new_value) = f(None) {
                    e.insert(new_value);
                }
            }
        }
    }

    /// Returns a point-in-time snapshot of all pending entries without
    /// clearing the pool.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Unconditionally clears every pending entry.
    ///
    /// `sync` calls this after it has finished processing every bin,
    /// whether or not individual bins failed — the clear is not
    /// conditioned on success.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of pending entries, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
