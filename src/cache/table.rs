//! The page cache ("cachetable"): pins and evicts nodes under a fixed byte
//! budget via clock-algorithm eviction, partial eviction, and
//! clone-for-checkpoint. The pair-list lock only guards structural changes
//! (insert/remove) to the `HashMap`, not per-pair access — each pair's own
//! lock governs reads/writes to its value — and the cache is generic over
//! [`CacheFile`] rather than storing raw callbacks.

use crate::block::BlockNum;
use crate::cache::file::{CacheFile, PartialEvictionCost};
use crate::cache::metrics::CacheMetrics;
use crate::cache::pair::{CachePair, FileId, PairKey, PinMode};
use crate::error::{Result, StoreError};
use crate::node::Node;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-budget cache of [`Node`]s keyed by `(file, blocknum)`.
pub struct CacheTable<F: CacheFile> {
    file: Arc<F>,
    file_id: FileId,
    pairs: RwLock<HashMap<PairKey, Arc<CachePair>>>,
    /// Clock hand order: pairs are pushed to the back on insert and on
    /// every sweep that spares them, popped from the front when swept.
    clock_order: Mutex<VecDeque<PairKey>>,
    /// Reservations for in-flight fetches, so concurrent misses on the
    /// same key wait on one disk read instead of issuing duplicates.
    in_flight: RwLock<HashMap<PairKey, Arc<Mutex<()>>>>,
    budget_bytes: AtomicU64,
    resident_bytes: AtomicU64,
    pub metrics: Arc<CacheMetrics>,
    /// Errors recorded by background threads (cleaner, eviction, prefetch)
    /// and surfaced on the next foreground call.
    background_errors: Mutex<Vec<String>>,
}

impl<F: CacheFile> CacheTable<F> {
    #[must_use]
    pub fn new(file: Arc<F>, file_id: FileId, budget_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            file,
            file_id,
            pairs: RwLock::new(HashMap::new()),
            clock_order: Mutex::new(VecDeque::new()),
            in_flight: RwLock::new(HashMap::new()),
            budget_bytes: AtomicU64::new(budget_bytes),
            resident_bytes: AtomicU64::new(0),
            metrics: Arc::new(CacheMetrics::default()),
            background_errors: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes.load(Ordering::Acquire)
    }

    pub fn set_budget_bytes(&self, budget: u64) {
        self.budget_bytes.store(budget, Ordering::Release);
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn record_background_error(&self, msg: String) {
        self.background_errors.lock().push(msg);
    }

    /// Drains and returns background errors recorded since the last call.
    pub fn take_background_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.background_errors.lock())
    }

    /// Looks up and pins `blocknum`, fetching it from `self.file` on a
    /// miss.
    ///
    /// `wait = false` asks for non-blocking semantics: if the requested
    /// lock would block, returns [`StoreError::TryAgain`] immediately
    /// instead of waiting. The caller is expected to release any other
    /// pairs it holds and reissue the operation from a higher level.
    ///
    /// # Errors
    /// Propagates I/O errors from the fetch callback, or
    /// [`StoreError::TryAgain`] under non-blocking contention.
    pub fn get_and_pin(
        table: &Arc<Self>,
        blocknum: BlockNum,
        mode: PinMode,
        wait: bool,
    ) -> Result<PinnedPair<F>> {
        let key = PairKey { file: table.file_id, blocknum };
        loop {
            if let Some(pair) = table.pairs.read().get(&key).cloned() {
                if !wait {
                    let acquirable = match mode {
                        PinMode::Read => pair.try_acquire_read().is_some(),
                        PinMode::WriteCheap | PinMode::WriteExpensive => {
                            match pair.try_acquire_write(mode) {
                                Some(guard) => {
                                    drop(guard);
                                    pair.release_write(mode);
                                    true
                                }
                                None => false,
                            }
                        }
                    };
                    if !acquirable {
                        table.metrics.try_again.fetch_add(1, Ordering::Relaxed);
                        return Err(StoreError::TryAgain);
                    }
                }
                table.metrics.hits.fetch_add(1, Ordering::Relaxed);
                pair.pin();
                return Ok(PinnedPair { table: Arc::clone(table), pair, mode });
            }

            // Miss: claim the right to fetch, so concurrent misses on the
            // same key wait on one disk read rather than duplicating it.
            let reservation = {
                let mut pairs = table.pairs.write();
                if pairs.contains_key(&key) {
                    continue;
                }
                let mut in_flight = table.in_flight.write();
                Arc::clone(in_flight.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
            };
            let _fetch_guard = reservation.lock();
            if let Some(pair) = table.pairs.read().get(&key).cloned() {
                table.in_flight.write().remove(&key);
                table.metrics.hits.fetch_add(1, Ordering::Relaxed);
                pair.pin();
                return Ok(PinnedPair { table: Arc::clone(table), pair, mode });
            }
            table.metrics.misses.fetch_add(1, Ordering::Relaxed);
            let fetch_result = table.file.fetch(blocknum);
            let (node, attr) = match fetch_result {
                Ok(v) => v,
                Err(e) => {
                    table.in_flight.write().remove(&key);
                    return Err(e);
                }
            };
            let pair = Arc::new(CachePair::new(key, node, attr, false));
            table.pairs.write().insert(key, Arc::clone(&pair));
            table.clock_order.lock().push_back(key);
            table.resident_bytes.fetch_add(attr as u64, Ordering::AcqRel);
            table.in_flight.write().remove(&key);
            pair.pin();
            table.maybe_evict();
            return Ok(PinnedPair { table: Arc::clone(table), pair, mode });
        }
    }

    /// As [`Self::get_and_pin`], but before returning, writes out any
    /// dependent pair in `deps` that is dirty and checkpoint-pending, so
    /// the returned pair and its dependents reach a mutually consistent
    /// checkpoint state.
    ///
    /// # Errors
    /// As [`Self::get_and_pin`], plus I/O errors writing out a dependent.
    pub fn get_and_pin_with_dep_pairs(
        table: &Arc<Self>,
        blocknum: BlockNum,
        mode: PinMode,
        wait: bool,
        deps: &[BlockNum],
    ) -> Result<PinnedPair<F>> {
        let pinned = Self::get_and_pin(table, blocknum, mode, wait)?;
        for &dep in deps {
            let dep_key = PairKey { file: table.file_id, blocknum: dep };
            let Some(dep_pair) = table.pairs.read().get(&dep_key).cloned() else { continue };
            if dep_pair.is_dirty() && dep_pair.is_checkpoint_pending() {
                table.write_out_pair_for_checkpoint(&dep_pair)?;
            }
        }
        Ok(pinned)
    }

    /// Inserts a freshly-born node (split, new root, create) as a dirty,
    /// already-pinned pair.
    pub fn insert_new(table: &Arc<Self>, blocknum: BlockNum, node: Node, attr_bytes: usize) -> PinnedPair<F> {
        let key = PairKey { file: table.file_id, blocknum };
        let pair = Arc::new(CachePair::new(key, node, attr_bytes, true));
        table.pairs.write().insert(key, Arc::clone(&pair));
        table.clock_order.lock().push_back(key);
        table.resident_bytes.fetch_add(attr_bytes as u64, Ordering::AcqRel);
        pair.pin();
        table.maybe_evict();
        PinnedPair { table: Arc::clone(table), pair, mode: PinMode::WriteExpensive }
    }

    /// Removes `blocknum` unconditionally, used once a node's block has
    /// been freed by a merge.
    pub fn remove(&self, blocknum: BlockNum) {
        let key = PairKey { file: self.file_id, blocknum };
        if let Some(pair) = self.pairs.write().remove(&key) {
            self.resident_bytes.fetch_sub(pair.attr_bytes(), Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_resident(&self, blocknum: BlockNum) -> bool {
        self.pairs.read().contains_key(&PairKey { file: self.file_id, blocknum })
    }

    /// Marks every currently-dirty pair `checkpoint_pending` and takes its
    /// point-in-time clone right now, under the pair's write lock, so a
    /// write landing after `begin_checkpoint` returns cannot leak into the
    /// checkpoint (spec.md §4.G step 1, §8 "a point-in-time image as of
    /// checkpoint-begin").
    pub fn begin_checkpoint(&self) {
        for pair in self.pairs.read().values() {
            if pair.is_dirty() {
                pair.set_checkpoint_pending(true);
                let guard = pair.acquire_write(PinMode::WriteCheap);
                let snapshot = self.file.clone_for_checkpoint(&guard);
                pair.release_write(PinMode::WriteCheap);
                drop(guard);
                pair.stash_checkpoint_snapshot(snapshot);
            }
        }
    }

    /// Every pair currently marked checkpoint-pending.
    #[must_use]
    pub fn checkpoint_pending_pairs(&self) -> Vec<Arc<CachePair>> {
        self.pairs.read().values().filter(|p| p.is_checkpoint_pending()).cloned().collect()
    }

    /// Returns `pair`'s point-in-time snapshot taken by
    /// [`Self::begin_checkpoint`]. Falls back to cloning the pair's current
    /// value under its write lock if no snapshot was stashed (a pair
    /// driven pending without going through `begin_checkpoint`, e.g. a
    /// dependent pair flushed out of band by
    /// [`Self::get_and_pin_with_dep_pairs`]).
    #[must_use]
    pub fn checkpoint_clone(&self, pair: &Arc<CachePair>) -> Node {
        if let Some(snapshot) = pair.take_checkpoint_snapshot() {
            return snapshot;
        }
        let guard = pair.acquire_write(PinMode::WriteCheap);
        let clone = self.file.clone_for_checkpoint(&guard);
        pair.release_write(PinMode::WriteCheap);
        clone
    }

    /// Marks `pair` clean and no-longer-checkpoint-pending once its clone
    /// has been durably written, and notifies the file.
    pub fn checkpoint_pair_complete(&self, pair: &Arc<CachePair>) {
        pair.mark_clean();
        pair.set_checkpoint_pending(false);
        self.file.checkpoint_complete(pair.key.blocknum);
        self.metrics.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Writes a dependent pair out immediately for
    /// [`Self::get_and_pin_with_dep_pairs`]: clone under lock, flush the
    /// clone, mark complete.
    fn write_out_pair_for_checkpoint(&self, pair: &Arc<CachePair>) -> Result<()> {
        let clone = self.checkpoint_clone(pair);
        self.file.flush(pair.key.blocknum, &clone, true)?;
        self.checkpoint_pair_complete(pair);
        Ok(())
    }

    /// Runs one clock sweep if resident bytes exceed the budget. Bounded to
    /// avoid looping forever when every pair is pinned or freshly touched.
    pub fn maybe_evict(&self) {
        let max_sweeps = self.clock_order.lock().len().saturating_mul(2) + 1;
        let mut swept = 0usize;
        while self.resident_bytes.load(Ordering::Acquire) > self.budget_bytes.load(Ordering::Acquire)
            && swept < max_sweeps
        {
            swept += 1;
            let Some(key) = self.clock_order.lock().pop_front() else { break };
            let Some(pair) = self.pairs.read().get(&key).cloned() else { continue };
            if pair.is_pinned() {
                self.clock_order.lock().push_back(key);
                continue;
            }
            if pair.clock_bit() {
                pair.set_clock_bit(false);
                self.clock_order.lock().push_back(key);
                continue;
            }
            // A dirty pair's resident partitions may hold modifications
            // that were never written back to their recorded `on_disk_*`
            // location; dropping one to ON_DISK would silently lose them.
            // Partial (and full) eviction is therefore only safe once the
            // pair is clean.
            if pair.is_dirty() {
                self.clock_order.lock().push_back(key);
                continue;
            }
            let cost = { self.file.pe_est(&pair.acquire_read()) };
            match cost {
                PartialEvictionCost::Nothing => {
                    self.evict_fully(&pair);
                }
                PartialEvictionCost::Cheap | PartialEvictionCost::Expensive => {
                    self.partial_evict(&pair);
                    self.clock_order.lock().push_back(key);
                }
            }
        }
    }

    /// Drops partitions from `pair` to release memory without evicting the
    /// whole node. The finalize step (updating the cache's byte accounting)
    /// happens after the pair's write lock is released.
    fn partial_evict(&self, pair: &Arc<CachePair>) -> usize {
        let Some(mut guard) = pair.try_acquire_write(PinMode::WriteCheap) else { return 0 };
        let freed = self.file.pe(&mut guard);
        pair.release_write(PinMode::WriteCheap);
        drop(guard);
        if freed > 0 {
            let new_attr = pair.attr_bytes().saturating_sub(freed as u64);
            pair.set_attr_bytes(new_attr as usize);
            self.resident_bytes.fetch_sub(freed as u64, Ordering::AcqRel);
            self.metrics.partial_evictions.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Removes a fully-evictable pair from the table. Only reached for
    /// pairs [`maybe_evict`] already confirmed clean, so the resident
    /// partitions (if any are still resident) already match what is
    /// durable on disk; there is nothing new to flush, and calling `flush`
    /// unconditionally here would ask the serializer to re-encode a node
    /// that may have had some of its partitions already partially evicted
    /// to `ON_DISK`.
    fn evict_fully(&self, pair: &Arc<CachePair>) {
        self.pairs.write().remove(&pair.key);
        self.resident_bytes.fetch_sub(pair.attr_bytes(), Ordering::AcqRel);
        self.metrics.clock_evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!("evicted {:?}", pair.key);
    }

    /// Installs `blocknum` in the background if absent, without pinning
    /// it.
    pub fn prefetch(table: &Arc<Self>, blocknum: BlockNum) {
        let key = PairKey { file: table.file_id, blocknum };
        if table.pairs.read().contains_key(&key) {
            return;
        }
        let table = Arc::clone(table);
        std::thread::spawn(move || {
            if table.pairs.read().contains_key(&key) {
                return;
            }
            match table.file.fetch(blocknum) {
                Ok((node, attr)) => {
                    let mut pairs = table.pairs.write();
                    if pairs.contains_key(&key) {
                        return;
                    }
                    pairs.insert(key, Arc::new(CachePair::new(key, node, attr, false)));
                    drop(pairs);
                    table.clock_order.lock().push_back(key);
                    table.resident_bytes.fetch_add(attr as u64, Ordering::AcqRel);
                }
                Err(e) => {
                    table.record_background_error(format!("prefetch failed for {blocknum:?}: {e}"));
                }
            }
        });
    }

    /// One cleaner-thread iteration: picks the resident internal pair with
    /// the largest child `workdone` and flushes messages from it toward
    /// one child.
    pub fn run_cleaner_once(&self) {
        self.metrics.cleaner_sweeps.fetch_add(1, Ordering::Relaxed);
        let candidate = {
            let pairs = self.pairs.read();
            pairs
                .values()
                .filter(|p| !p.is_pinned())
                .filter_map(|p| {
                    let node = p.try_acquire_read()?;
                    if node.is_leaf() {
                        return None;
                    }
                    let workdone = node.children.iter().map(|c| c.workdone).max().unwrap_or(0);
                    Some((workdone, Arc::clone(p)))
                })
                .max_by_key(|(workdone, _)| *workdone)
        };
        let Some((workdone, pair)) = candidate else { return };
        let Some(mut guard) = pair.try_acquire_write(PinMode::WriteCheap) else { return };
        if let Err(e) = self.file.cleaner(&mut guard) {
            self.record_background_error(format!("cleaner failed for {:?}: {e}", pair.key));
        } else {
            pair.mark_dirty();
            log::debug!("cleaner flushed {:?} (workdone={workdone})", pair.key);
        }
        pair.release_write(PinMode::WriteCheap);
    }
}

/// RAII pin on a [`CachePair`]: releases the pin (and re-checks the byte
/// budget) on drop, regardless of how the caller's scope exits.
pub struct PinnedPair<F: CacheFile> {
    table: Arc<CacheTable<F>>,
    pair: Arc<CachePair>,
    mode: PinMode,
}

impl<F: CacheFile> PinnedPair<F> {
    #[must_use]
    pub fn key(&self) -> PairKey {
        self.pair.key
    }

    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.pair.acquire_read()
    }

    /// Acquires the node for mutation at the lock mode this pair was
    /// pinned with.
    ///
    /// # Panics
    /// Panics if this pair was pinned with [`PinMode::Read`]: write access
    /// requires having pinned `WriteCheap` or `WriteExpensive` up front.
    pub fn write(&self) -> PinnedWriteGuard<'_> {
        assert!(self.mode != PinMode::Read, "PinnedPair::write: pair was pinned Read-only");
        let guard = self.pair.acquire_write(self.mode);
        PinnedWriteGuard { pair: &self.pair, mode: self.mode, guard: Some(guard) }
    }

    pub fn mark_dirty(&self) {
        self.pair.mark_dirty();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.pair.is_dirty()
    }
}

/// Write guard returned by [`PinnedPair::write`]; releases the
/// `WRITE_EXPENSIVE` witness bit on drop in addition to the lock itself.
pub struct PinnedWriteGuard<'a> {
    pair: &'a CachePair,
    mode: PinMode,
    guard: Option<RwLockWriteGuard<'a, Node>>,
}

impl std::ops::Deref for PinnedWriteGuard<'_> {
    type Target = Node;
    fn deref(&self) -> &Node {
        self.guard.as_ref().expect("PinnedWriteGuard: guard taken")
    }
}

impl std::ops::DerefMut for PinnedWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Node {
        self.guard.as_mut().expect("PinnedWriteGuard: guard taken")
    }
}

impl Drop for PinnedWriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.pair.release_write(self.mode);
    }
}

impl<F: CacheFile> Drop for PinnedPair<F> {
    fn drop(&mut self) {
        self.pair.unpin();
        self.table.maybe_evict();
    }
}
