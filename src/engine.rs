//! The engine façade: orchestrates the hasher, shard store, n-gram index,
//! KVPool, and cache behind `set`/`get`/`remove`/`sync`/`transfer_from`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_utils::sync::WaitGroup;
use log::{error, warn};

use crate::cache::{Cache, CacheRefresher, Loader};
use crate::error::{Result, StorageError};
use crate::hasher::hash_bin;
use crate::ngram::{
    format_postings, merge_member, ngrams, parse_postings, remove_member, NGRAM_LEN, WILDCARD_CHAR,
};
use crate::pool::KvPool;
use crate::record::{keyval_key, strip_keyval_prefix, strip_trigram_prefix, trigram_key};
use crate::shard_store::ShardStore;
use crate::thread_pool::{DropJoinThreadPool, ThreadPool};

/// Construction options for [`Engine`]. Mirrors spec.md §6's configuration
/// table; there is no config-file format, so this is a plain struct rather
/// than something deserialized.
pub struct EngineConfig {
    /// Root directory for shard and parity files; created if missing.
    pub storage_directory: PathBuf,
    /// Number of shards (`B`). Immutable after construction.
    pub bin_count: usize,
    /// If false, no checksum verification, no recovery retries, and no
    /// parity files are maintained.
    pub enable_parity: bool,
    /// Members per parity group (`P`).
    pub parity_group_size: usize,
    /// Optional read-through cache configuration.
    pub cache: Option<CacheConfig>,
}

/// Cache sizing and refresh settings for an [`Engine`].
pub struct CacheConfig {
    /// Maximum number of cached bins.
    pub capacity: usize,
    /// Path of the `.cache` sidecar file.
    pub sidecar_path: PathBuf,
    /// How often the background refresher sweeps the cache.
    pub update_cycle: Duration,
}

/// Outcome of a [`Engine::sync`] call: which bins were written, and which
/// bins failed (logged at the point of failure as well). This is the
/// "tighter contract" spec.md §7 invites implementers to consider instead
/// of pure fire-and-forget logging; the KVPool is still cleared
/// unconditionally regardless of what this report contains.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Number of bins successfully written.
    pub bins_written: usize,
    /// Per-bin failures encountered while flushing.
    pub failures: Vec<(usize, StorageError)>,
}

enum BinOp {
    DeleteKey(String),
    PurgeMember { gram_key: String, member: String },
}

/// The storage engine façade. Generic over the worker pool implementation,
/// mirroring how the teacher parameterizes its server over a pluggable
/// engine; defaults to [`DropJoinThreadPool`].
pub struct Engine<P: ThreadPool = DropJoinThreadPool> {
    store: Arc<ShardStore>,
    write_buffer: KvPool,
    cache: Option<Arc<Cache>>,
    refresher: Option<CacheRefresher>,
    workers: P,
}

impl Engine<DropJoinThreadPool> {
    /// Opens the engine with the default worker pool, sized to the number
    /// of hardware cores per spec.md §5 ("parallel threads on a
    /// fixed-size worker pool sized to the number of hardware cores"),
    /// mirroring the teacher's own `RayonThreadPool::new(num_cpus::get())`
    /// call site (now dropped along with the server binary it lived in).
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::new(config, DropJoinThreadPool::new(num_cpus::get())?)
    }
}

impl<P: ThreadPool> Engine<P> {
    /// Opens (creating if missing) the storage directory described by
    /// `config`, wires up the optional cache and its background
    /// refresher, and runs subsequent bin-parallel work on `workers`.
    pub fn new(config: EngineConfig, workers: P) -> Result<Self> {
        let store = Arc::new(ShardStore::new(
            config.storage_directory,
            config.bin_count,
            config.enable_parity,
            config.parity_group_size,
        )?);

        let (cache, refresher) = match config.cache {
            Some(cache_cfg) => {
                let cache = Arc::new(Cache::new(cache_cfg.capacity, cache_cfg.sidecar_path));
                let loader_store = Arc::clone(&store);
                let loader: Loader = Arc::new(move |bin| loader_store.read_locked(bin));
                let refresher =
                    CacheRefresher::spawn(Arc::clone(&cache), loader, cache_cfg.update_cycle);
                (Some(cache), Some(refresher))
            }
            None => (None, None),
        };

        Ok(Self {
            store,
            write_buffer: KvPool::new(),
            cache,
            refresher,
            workers,
        })
    }

    fn bin_of(&self, ondisk_key: &str) -> usize {
        hash_bin(ondisk_key, self.store.bin_count())
    }

    fn read_shard_through_cache(&self, bin: usize) -> Result<crate::cache::ShardSnapshot> {
        read_through(&self.store, self.cache.as_ref(), bin)
    }

    /// KVPool first, then the cache-backed shard.
    fn load_record(&self, ondisk_key: &str) -> Result<Option<String>> {
        if let Some(v) = self.write_buffer.get(ondisk_key) {
            return Ok(Some(v));
        }
        let bin = self.bin_of(ondisk_key);
        let shard = self.read_shard_through_cache(bin)?;
        Ok(shard.get(ondisk_key).cloned())
    }

    /// KVPool first for each key, then the shards loaded once per bin.
    fn load_records_batch(&self, keys: &[String]) -> HashMap<String, String> {
        let mut result = HashMap::new();
        let mut remaining: HashMap<usize, Vec<String>> = HashMap::new();

        for key in keys {
            if let Some(v) = self.write_buffer.get(key) {
                result.insert(key.clone(), v);
            } else {
                remaining.entry(self.bin_of(key)).or_default().push(key.clone());
            }
        }

        if remaining.is_empty() {
            return result;
        }

        let collected = Arc::new(Mutex::new(HashMap::new()));
        let wg = WaitGroup::new();
        for (bin, wanted) in remaining {
            let store = Arc::clone(&self.store);
            let cache = self.cache.clone();
            let collected = Arc::clone(&collected);
            let wg = wg.clone();
            self.workers.spawn(move || {
                match read_through(&store, cache.as_ref(), bin) {
                    Ok(shard) => {
                        let mut collected = collected.lock().unwrap();
                        for key in wanted {
                            if let Some(v) = shard.get(&key) {
                                collected.insert(key, v.clone());
                            }
                        }
                    }
                    Err(e) => error!("failed to read bin {} for batch lookup: {}", bin, e),
                }
                drop(wg);
            });
        }
        wg.wait();

        // `WaitGroup`'s own completion counter is unrelated to `collected`'s
        // strong count: a worker's `drop(wg)` can wake `wg.wait()` before
        // that same worker's stack frame has finished dropping its clone of
        // `collected`, so `Arc::try_unwrap` can still see more than one
        // owner here and must not be used. Locking and taking the contents
        // works regardless of how many clones are still alive.
        let collected = std::mem::take(&mut *collected.lock().unwrap());
        result.extend(collected);
        result
    }

    /// Resolves a wildcard query to the literal stored keys it currently
    /// matches, via n-gram candidate intersection (no final literal
    /// recheck — over-match is the documented contract, spec.md §4.1).
    ///
    /// The query is split on `*` into its non-wildcard runs. A run of at
    /// least [`NGRAM_LEN`] characters contributes the exact intersection of
    /// its own 8-gram posting lists, same as indexing. A run shorter than
    /// [`NGRAM_LEN`] cannot address a stored 8-gram directly (spec.md §9:
    /// "over-match is possible when q has fewer than 8 non-wildcard
    /// consecutive characters"), so it instead contributes the union of
    /// every currently indexed gram's posting list whose gram starts with
    /// that run. A query made of nothing but `*` (no non-wildcard run at
    /// all) is unconstrained and matches every currently stored key.
    fn resolve_wildcard(&self, query: &str) -> Vec<String> {
        let runs: Vec<&str> = query.split(WILDCARD_CHAR).filter(|s| !s.is_empty()).collect();
        if runs.is_empty() {
            return self.all_stored_keys();
        }

        let mut candidate: Option<HashSet<String>> = None;
        for run in runs {
            let contribution = if run.chars().count() >= NGRAM_LEN {
                self.exact_gram_intersection(run)
            } else {
                self.gram_prefix_union(run)
            };

            candidate = Some(match candidate {
                None => contribution,
                Some(existing) => existing.intersection(&contribution).cloned().collect(),
            });

            if candidate.as_ref().map_or(false, |c| c.len() <= 1) {
                break;
            }
        }

        candidate.unwrap_or_default().into_iter().collect()
    }

    /// Intersection of the posting lists of every 8-gram of `run` (which
    /// contains no `*`), exactly as used for indexing.
    fn exact_gram_intersection(&self, run: &str) -> HashSet<String> {
        let grams = ngrams(run);
        let gram_keys: Vec<String> = grams.iter().map(|g| trigram_key(g)).collect();
        let records = self.load_records_batch(&gram_keys);

        let mut acc: Option<HashSet<String>> = None;
        for gram_key in &gram_keys {
            let list: HashSet<String> = records
                .get(gram_key)
                .map(|payload| parse_postings(payload).into_iter().collect())
                .unwrap_or_default();
            acc = Some(match acc {
                None => list,
                Some(existing) => existing.intersection(&list).cloned().collect(),
            });
        }
        acc.unwrap_or_default()
    }

    /// Union of the posting lists of every currently indexed gram that
    /// starts with `run` (shorter than [`NGRAM_LEN`]), scanning the
    /// `TRIGRM` namespace of every bin plus any not-yet-synced posting-list
    /// entries staged in the KVPool.
    fn gram_prefix_union(&self, run: &str) -> HashSet<String> {
        let mut out = HashSet::new();

        for (ondisk_key, payload) in self.write_buffer.snapshot() {
            if let Some(gram) = strip_trigram_prefix(&ondisk_key) {
                if gram.starts_with(run) {
                    out.extend(parse_postings(&payload));
                }
            }
        }

        for bin in 0..self.store.bin_count() {
            match self.read_shard_through_cache(bin) {
                Ok(shard) => {
                    for (ondisk_key, payload) in &shard {
                        if let Some(gram) = strip_trigram_prefix(ondisk_key) {
                            if gram.starts_with(run) {
                                out.extend(parse_postings(payload));
                            }
                        }
                    }
                }
                Err(e) => warn!("failed to scan bin {} for gram prefix {:?}: {}", bin, run, e),
            }
        }

        out
    }

    /// Every currently stored user key, across the KVPool and all bins.
    /// Used when a wildcard query consists of nothing but `*`.
    fn all_stored_keys(&self) -> Vec<String> {
        let mut out = HashSet::new();
        for (ondisk_key, _) in self.write_buffer.snapshot() {
            if let Some(user_key) = strip_keyval_prefix(&ondisk_key) {
                out.insert(user_key.to_string());
            }
        }
        match self.scan_value_records() {
            Ok(records) => {
                for (user_key, _) in records {
                    out.insert(user_key);
                }
            }
            Err(e) => warn!("failed to scan all value records for full wildcard: {}", e),
        }
        out.into_iter().collect()
    }

    /// Stages key/value pairs into the KVPool. Wildcard keys are expanded
    /// against the current index; a wildcard with no current matches has
    /// no effect on that entry. If `gen_ngram`, every 8-gram of each
    /// non-wildcard target key has its posting list updated (read via
    /// KVPool-then-shard, written back into the KVPool). Never fails
    /// synchronously.
    pub fn set(&self, entries: HashMap<String, String>, gen_ngram: bool) {
        for (key, value) in entries {
            if key.contains(WILDCARD_CHAR) {
                for matched in self.resolve_wildcard(&key) {
                    self.stage_set(matched, value.clone(), gen_ngram);
                }
            } else {
                self.stage_set(key, value, gen_ngram);
            }
        }
    }

    fn stage_set(&self, key: String, value: String, gen_ngram: bool) {
        let ondisk = keyval_key(&key);
        self.write_buffer.stage(ondisk, value);

        if gen_ngram {
            for gram in ngrams(&key) {
                let gram_key = trigram_key(&gram);
                let payload = match self.load_record(&gram_key) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            "failed to read posting list {} while indexing {}: {}",
                            gram_key, key, e
                        );
                        None
                    }
                };
                let mut members = parse_postings(payload.as_deref().unwrap_or(""));
                if merge_member(&mut members, &key) {
                    self.write_buffer.stage(gram_key, format_postings(&members));
                }
            }
        }
    }

    /// Returns every *found* key among `keys` (literal or wildcard) mapped
    /// to its current value. Missing keys are simply absent; I/O errors
    /// are logged, not surfaced.
    pub fn get(&self, keys: &[String]) -> HashMap<String, String> {
        let mut candidates: Vec<String> = Vec::new();
        for key in keys {
            if key.contains(WILDCARD_CHAR) {
                candidates.extend(self.resolve_wildcard(key));
            } else {
                candidates.push(key.clone());
            }
        }
        candidates.sort();
        candidates.dedup();

        let ondisk: Vec<String> = candidates.iter().map(|k| keyval_key(k)).collect();
        let fetched = self.load_records_batch(&ondisk);

        let mut out = HashMap::new();
        for key in candidates {
            let ondisk_key = keyval_key(&key);
            if let Some(v) = fetched.get(&ondisk_key) {
                out.insert(key, v.clone());
            }
        }
        out
    }

    /// Removes value records and purges the removed keys from every
    /// posting list their own 8-grams indexed them under. Wildcard keys
    /// are expanded against the current index first. This acts directly on
    /// the shards (not staged in the KVPool) so it is visible to a `sync`
    /// that starts after it returns — but it must *also* cancel any
    /// matching pending KVPool mutation, or an unsynced `set` of the same
    /// key (or an unsynced posting-list update for one of its grams) would
    /// otherwise resurrect exactly what was just removed the next time
    /// `sync` runs.
    pub fn remove(&self, keys: &[String]) {
        let mut literal: Vec<String> = Vec::new();
        for key in keys {
            if key.contains(WILDCARD_CHAR) {
                literal.extend(self.resolve_wildcard(key));
            } else {
                literal.push(key.clone());
            }
        }
        literal.sort();
        literal.dedup();
        if literal.is_empty() {
            return;
        }

        for key in &literal {
            self.write_buffer.remove(&keyval_key(key));
            for gram in ngrams(key) {
                let gram_key = trigram_key(&gram);
                let member = key.clone();
                self.write_buffer.update_or_remove(&gram_key, move |current| {
                    let mut members = parse_postings(current.unwrap_or(""));
                    remove_member(&mut members, &member);
                    if members.is_empty() {
                        None
                    } else {
                        Some(format_postings(&members))
                    }
                });
            }
        }

        let mut ops: HashMap<usize, Vec<BinOp>> = HashMap::new();
        for key in &literal {
            let value_key = keyval_key(key);
            ops.entry(self.bin_of(&value_key))
                .or_default()
                .push(BinOp::DeleteKey(value_key));

            for gram in ngrams(key) {
                let gram_key = trigram_key(&gram);
                ops.entry(self.bin_of(&gram_key)).or_default().push(BinOp::PurgeMember {
                    gram_key,
                    member: key.clone(),
                });
            }
        }

        let wg = WaitGroup::new();
        for (bin, bin_ops) in ops {
            let store = Arc::clone(&self.store);
            let cache = self.cache.clone();
            let wg = wg.clone();
            self.workers.spawn(move || {
                let result = store.read_modify_write(bin, |data| {
                    for op in bin_ops {
                        match op {
                            BinOp::DeleteKey(k) => {
                                data.remove(&k);
                            }
                            BinOp::PurgeMember { gram_key, member } => {
                                if let Some(payload) = data.get(&gram_key).cloned() {
                                    let mut members = parse_postings(&payload);
                                    remove_member(&mut members, &member);
                                    if members.is_empty() {
                                        data.remove(&gram_key);
                                    } else {
                                        data.insert(gram_key, format_postings(&members));
                                    }
                                }
                            }
                        }
                    }
                });
                match result {
                    Ok(data) => {
                        if let Some(cache) = &cache {
                            cache.replace_snapshot(bin, data);
                        }
                    }
                    Err(e) => error!("remove failed for bin {}: {}", bin, e),
                }
                drop(wg);
            });
        }
        wg.wait();
    }

    /// Flushes the KVPool to shards, grouped by destination bin and
    /// processed one bin at a time under that bin's lock, refreshing the
    /// affected parity group after each successful write. The KVPool is
    /// cleared unconditionally once every bin has been attempted,
    /// regardless of whether any of them failed.
    pub fn sync(&self) -> Result<SyncReport> {
        let pending = self.write_buffer.snapshot();
        let mut grouped: HashMap<usize, Vec<(String, String)>> = HashMap::new();
        for (key, value) in pending {
            grouped.entry(self.bin_of(&key)).or_default().push((key, value));
        }

        let failures = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new();

        for (bin, entries) in grouped {
            let store = Arc::clone(&self.store);
            let cache = self.cache.clone();
            let failures = Arc::clone(&failures);
            let written = Arc::clone(&written);
            let wg = wg.clone();
            self.workers.spawn(move || {
                let result = store.read_modify_write(bin, |data| {
                    for (key, value) in entries {
                        data.insert(key, value);
                    }
                });
                match result {
                    Ok(data) => {
                        if let Some(cache) = &cache {
                            cache.replace_snapshot(bin, data);
                        }
                        written.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        error!("sync failed for bin {}: {}", bin, e);
                        failures.lock().unwrap().push((bin, e));
                    }
                }
                drop(wg);
            });
        }
        wg.wait();

        // Unconditional: cleared whether or not any bin above failed.
        self.write_buffer.clear();

        // See the matching comment in `load_records_batch`: a worker's
        // `drop(wg)` can wake `wg.wait()` before that worker has finished
        // dropping its own clone of `failures`, so `Arc::try_unwrap` is not
        // safe here either.
        let failures = std::mem::take(&mut *failures.lock().unwrap());
        Ok(SyncReport {
            bins_written: written.load(Ordering::SeqCst),
            failures,
        })
    }

    /// Reads every persisted value record across all bins. Used by
    /// `transfer_from`; bypasses the KVPool since it is meant to capture
    /// what another engine has actually durable, not another caller's
    /// in-flight writes.
    pub fn scan_value_records(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for bin in 0..self.store.bin_count() {
            let shard = self.store.read_locked(bin)?;
            for (ondisk_key, value) in shard {
                if let Some(user_key) = strip_keyval_prefix(&ondisk_key) {
                    out.push((user_key.to_string(), value));
                }
            }
        }
        Ok(out)
    }

    /// Copies every persisted value record from `src` into this engine's
    /// KVPool (not yet synced to shards). `src` may run on a different
    /// worker pool implementation.
    pub fn transfer_from<Q: ThreadPool>(&self, src: &Engine<Q>, gen_ngram: bool) -> Result<()> {
        let records = src.scan_value_records()?;
        let entries: HashMap<String, String> = records.into_iter().collect();
        self.set(entries, gen_ngram);
        Ok(())
    }
}

fn read_through(
    store: &ShardStore,
    cache: Option<&Arc<Cache>>,
    bin: usize,
) -> Result<crate::cache::ShardSnapshot> {
    if let Some(cache) = cache {
        if let Some(snapshot) = cache.get_cache_content(bin) {
            return Ok(snapshot);
        }
    }
    let data = store.read_locked(bin)?;
    if let Some(cache) = cache {
        cache.replace_snapshot(bin, data.clone());
    }
    Ok(data)
}
