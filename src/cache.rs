//! The read-through, approximately-LRU bin cache and its background
//! refresh scheduler.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

/// A decoded shard's contents, keyed by on-disk key.
pub type ShardSnapshot = BTreeMap<String, String>;

/// Inner state guarded by [`Cache`]'s single mutex, replacing the
/// original's nowhere-keyed, process-global mutable helper (spec.md §9)
/// with a plain struct owned by the cache instance.
struct CacheState {
    /// Bin order, head = most recently touched.
    order: VecDeque<usize>,
    /// Decoded snapshot per cached bin.
    snapshots: HashMap<usize, ShardSnapshot>,
}

/// Bounded, approximately-LRU cache mapping bin index to decoded shard
/// contents.
///
/// `get_cache_content`/`update_cache_content`/the background refresh sweep
/// all run under `state`'s mutex, so they are mutually exclusive on one
/// cache instance. `busy` is kept as a separate compare-and-swap guard
/// (rather than the original's plain boolean, spec.md §9) purely to let the
/// refresh sweep skip itself without blocking readers/writers while a
/// previous sweep is still draining an unusually slow loader.
pub struct Cache {
    capacity: usize,
    sidecar_path: PathBuf,
    state: Mutex<CacheState>,
    busy: AtomicBool,
}

impl Cache {
    /// Builds a cache of the given bound, populated at startup from
    /// `sidecar_path` if it exists (invalid/duplicate tokens tolerated with
    /// best effort — see [`read_cache_sidecar`]). Populated entries start
    /// with an empty snapshot; the first reader or the first background
    /// refresh fills it in.
    pub fn new(capacity: usize, sidecar_path: PathBuf) -> Self {
        let mut order = read_cache_sidecar(&sidecar_path);
        let mut seen = HashSet::new();
        order.retain(|bin| seen.insert(*bin));
        order.truncate(capacity);

        let snapshots = order.iter().map(|&b| (b, ShardSnapshot::new())).collect();

        Self {
            capacity,
            sidecar_path,
            state: Mutex::new(CacheState {
                order: order.into(),
                snapshots,
            }),
            busy: AtomicBool::new(false),
        }
    }

    /// Looks up `bin`. If present, promotes it one position toward the
    /// head (swap with its predecessor) and returns a clone of its
    /// snapshot. Returns `None` if absent — "not present" per spec.md
    /// §4.6.
    pub fn get_cache_content(&self, bin: usize) -> Option<ShardSnapshot> {
        let mut state = self.state.lock().unwrap();
        if !state.snapshots.contains_key(&bin) {
            return None;
        }
        if let Some(pos) = state.order.iter().position(|&b| b == bin) {
            if pos > 0 {
                state.order.swap(pos, pos - 1);
            }
        }
        state.snapshots.get(&bin).cloned()
    }

    /// Merges `data`'s entries into `bin`'s existing snapshot, or inserts
    /// `bin` at the middle of the order if absent, evicting the tail if the
    /// bound is exceeded. This is the literal public-API semantics from
    /// spec.md §4.6: it merges rather than replaces, so a caller that wants
    /// deletions reflected must not rely on this path alone (the engine's
    /// own write path keeps the cache exactly fresh via `replace_snapshot`,
    /// see engine.rs).
    pub fn update_cache_content(&self, bin: usize, data: ShardSnapshot) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.snapshots.get_mut(&bin) {
            existing.extend(data);
            return;
        }

        let mid = state.order.len() / 2;
        state.order.insert(mid, bin);
        state.snapshots.insert(bin, data);

        if state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_back() {
                state.snapshots.remove(&evicted);
            }
        }
    }

    /// Replaces `bin`'s snapshot outright (inserting it if absent, with the
    /// same middle-insert/tail-evict policy as `update_cache_content`).
    /// Used internally by the engine's write path and by the background
    /// refresher, both of which need exact freshness rather than a merge.
    pub(crate) fn replace_snapshot(&self, bin: usize, data: ShardSnapshot) {
        let mut state = self.state.lock().unwrap();
        if state.snapshots.contains_key(&bin) {
            state.snapshots.insert(bin, data);
            return;
        }

        let mid = state.order.len() / 2;
        state.order.insert(mid, bin);
        state.snapshots.insert(bin, data);

        if state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_back() {
                state.snapshots.remove(&evicted);
            }
        }
    }

    fn order_snapshot(&self) -> Vec<usize> {
        self.state.lock().unwrap().order.iter().copied().collect()
    }

    fn try_begin_refresh(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_refresh(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Parses a `.cache` sidecar file: one or more lines of comma-separated
/// decimal bin indices, whitespace trimmed, non-integer tokens logged and
/// skipped. Missing files yield an empty order.
pub fn read_cache_sidecar(path: &Path) -> Vec<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let mut order = Vec::new();
    for token in contents.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<usize>() {
            Ok(bin) => order.push(bin),
            Err(_) => warn!("skipping non-integer cache sidecar token: {:?}", token),
        }
    }
    order
}

/// Writes `order` back to `path` as a comma-separated line of decimal bin
/// indices.
pub fn write_cache_sidecar(path: &Path, order: &[usize]) -> std::io::Result<()> {
    let body = order
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",");
    std::fs::write(path, body)
}

/// A loader re-reads one bin's shard contents from durable storage,
/// bypassing the cache. Supplied by the engine so this module never
/// depends on `ShardStore` directly.
pub type Loader = Arc<dyn Fn(usize) -> crate::error::Result<ShardSnapshot> + Send + Sync>;

/// Owns the background thread that periodically re-reads every cached
/// bin and rewrites the cache sidecar. Stopped (with a bounded wait) when
/// dropped.
pub struct CacheRefresher {
    handle: Option<JoinHandle<()>>,
    stop: mpsc::Sender<()>,
}

impl CacheRefresher {
    /// Spawns the refresh loop: every `update_cycle` it skips if a sweep is
    /// already in flight (via `Cache::try_begin_refresh`), otherwise it
    /// re-reads every currently cached bin with `loader`, replaces their
    /// snapshots, and rewrites the sidecar with the current order.
    pub fn spawn(cache: Arc<Cache>, loader: Loader, update_cycle: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(update_cycle) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    run_refresh_sweep(&cache, &loader);
                }
            }
        });

        Self {
            handle: Some(handle),
            stop: stop_tx,
        }
    }
}

fn run_refresh_sweep(cache: &Arc<Cache>, loader: &Loader) {
    if !cache.try_begin_refresh() {
        debug!("cache refresh skipped: previous sweep still busy");
        return;
    }

    let order = cache.order_snapshot();
    for bin in &order {
        match loader(*bin) {
            Ok(data) => cache.replace_snapshot(*bin, data),
            Err(e) => error!("cache refresh failed for bin {}: {}", bin, e),
        }
    }

    if let Err(e) = write_cache_sidecar(&cache.sidecar_path, &order) {
        error!("failed to write cache sidecar {:?}: {}", cache.sidecar_path, e);
    }

    cache.end_refresh();
}

impl Drop for CacheRefresher {
    /// Signals the background thread to stop and waits up to 60 seconds
    /// for it to exit, per spec.md §5 ("Shutdown drains the scheduled
    /// cache refresher with a 60-second timeout before forced
    /// termination"). Rust cannot forcibly terminate a running thread, so
    /// past the timeout this just logs and lets the thread finish on its
    /// own; worker pool shutdown remains the owner's responsibility.
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let (done_tx, done_rx) = mpsc::channel::<()>();
            thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(Duration::from_secs(60)).is_err() {
                warn!("cache refresher did not stop within 60s during shutdown");
            }
        }
    }
}
