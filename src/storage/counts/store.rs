use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{OutOfOrderSequence, SequenceSnapshot};
use crate::storage::index::{
    CountsHeader, CountsIndex, FileCountsIndex, IndexUpdate, INVALID_COUNT,
};
use crate::storage::metrics::CountsMetrics;
use crate::storage::options::CountsStoreOptions;
use crate::types::{CountsError, Result, TxId};

use super::changes::{CountsChanges, ABSENT};
use super::key::{CountsKey, EncodedKey, KeyLayout};
use super::rebuild::Rebuilder;
use super::updater::{CountUpdater, ReentryMark};

/// Persisted watermark meaning "never checkpointed after a rebuild".
pub const NEEDS_REBUILDING_HIGH_ID: TxId = TxId(0);

/// Outcome of a [`CountsStore::checkpoint`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Watermark written to the index header.
    pub highest_gap_free: TxId,
    /// Number of stray ids written alongside the watermark.
    pub stray_tx_ids: usize,
    /// Changed keys merged into the index by this checkpoint.
    pub merged_keys: usize,
    /// Keys stored in the index after the merge.
    pub persisted_keys: usize,
}

/// Transactional store of aggregate counts.
///
/// Counts are the persisted value in the index plus the deltas accumulated in the
/// live [`CountsChanges`] generation. Transactions apply through [`CountUpdater`]s;
/// a checkpoint switches to a fresh generation, merges the frozen one into the
/// index and makes the index durable together with the applied-id watermark.
///
/// Locking, outermost first:
/// - `checkpoint_mutex` serializes generation switches and merges of checkpoints
///   and cache flushes;
/// - `durable_mutex` orders checkpoint file writes; it is taken before
///   `checkpoint_mutex` is released, and a write never holds the other locks;
/// - `lock` is held shared by transactional updaters and exclusively by direct
///   updaters and by the generation switch;
/// - `changes` guards the pointer to the live generation and is held exclusively
///   only while a merge batch lands in the index.
pub struct CountsStore {
    index: Box<dyn CountsIndex>,
    layout: KeyLayout,
    options: CountsStoreOptions,
    metrics: Arc<dyn CountsMetrics>,
    lock: RwLock<()>,
    changes: RwLock<Arc<CountsChanges>>,
    sequence: OutOfOrderSequence,
    checkpoint_mutex: Mutex<()>,
    durable_mutex: Mutex<()>,
    needs_rebuild: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
}

impl CountsStore {
    /// Opens the counts file at `path`.
    ///
    /// A missing file is created and marked for rebuild. A file failing
    /// validation is deleted and recreated, and likewise marked for rebuild. In
    /// read-only mode both cases are errors instead.
    pub fn open(path: impl AsRef<Path>, options: CountsStoreOptions) -> Result<Self> {
        let path = path.as_ref();
        let sync = options.sync_on_checkpoint;
        let index = match FileCountsIndex::open(path, options.read_only, sync) {
            Ok(index) => index,
            Err(err) if err.is_corruption() && !options.read_only => {
                warn!(path = %path.display(), error = %err, "counts.open.corrupt");
                fs::remove_file(path)?;
                FileCountsIndex::open(path, false, sync)?
            }
            Err(err) => return Err(err),
        };
        Self::with_index(Box::new(index), options)
    }

    /// Builds a store over an already opened index.
    pub fn with_index(index: Box<dyn CountsIndex>, options: CountsStoreOptions) -> Result<Self> {
        let header = index.header();
        let needs_rebuild = header
            .as_ref()
            .map_or(true, |h| h.highest_gap_free == NEEDS_REBUILDING_HIGH_ID);
        let header = header.unwrap_or(CountsHeader {
            highest_gap_free: NEEDS_REBUILDING_HIGH_ID,
            stray_tx_ids: Vec::new(),
        });
        debug!(
            highest_gap_free = %header.highest_gap_free,
            strays = header.stray_tx_ids.len(),
            needs_rebuild,
            "counts.open"
        );
        let metrics = options.metrics_or_default();
        Ok(Self {
            index,
            layout: KeyLayout,
            metrics,
            lock: RwLock::new(()),
            changes: RwLock::new(Arc::new(CountsChanges::new())),
            sequence: OutOfOrderSequence::new(header.highest_gap_free, &header.stray_tx_ids),
            checkpoint_mutex: Mutex::new(()),
            durable_mutex: Mutex::new(()),
            needs_rebuild: AtomicBool::new(needs_rebuild),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            options,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CountsError::Invalid("counts store closed"));
        }
        Ok(())
    }

    /// Rebuilds the counts through `rebuilder` if the persisted state is missing,
    /// damaged or out of step with the caller's last committed transaction.
    ///
    /// Calling `start` again after it succeeded does nothing.
    pub fn start(&self, rebuilder: &dyn Rebuilder) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.checkpoint_mutex.lock();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let last_committed = rebuilder.last_committed_tx_id();
        let persisted = self.sequence.highest_gap_free();
        let needs_rebuild = self.needs_rebuild.load(Ordering::Acquire);
        if needs_rebuild || last_committed != persisted {
            if self.options.read_only {
                return Err(CountsError::ReadOnly(
                    "counts store needs rebuilding, most likely the database needs recovery",
                ));
            }
            info!(
                needs_rebuild,
                persisted = %persisted,
                last_committed = %last_committed,
                "counts.rebuild"
            );
            {
                let _exclusive = self.lock.write();
                self.index.clear()?;
                *self.changes.write() = Arc::new(CountsChanges::new());
            }
            let mut updater = self.direct_updater(false)?;
            rebuilder.rebuild(&mut updater)?;
            updater.close()?;
            self.sequence.set(last_committed, &[]);
            self.needs_rebuild.store(false, Ordering::Release);
            self.metrics.rebuild();
            info!(
                keys = self.index.len(),
                highest_gap_free = %last_committed,
                "counts.rebuild.done"
            );
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Reads the absolute count for `key`.
    ///
    /// Fails with [`CountsError::InvalidCount`] when the persisted value is marked
    /// invalid or the persisted value plus live changes is negative.
    pub fn read(&self, key: &CountsKey) -> Result<i64> {
        self.ensure_open()?;
        let encoded = self.layout.encode(key);
        let (persisted, live) = {
            let view = self.changes.read();
            (self.index.get(&encoded)?, view.get(key))
        };
        let persisted = match persisted {
            Some(value) if value < 0 => return Err(CountsError::InvalidCount { key: *key }),
            Some(value) => value,
            None => 0,
        };
        let live = if live == ABSENT { 0 } else { live };
        match persisted.checked_add(live) {
            Some(count) if count >= 0 => Ok(count),
            _ => Err(CountsError::InvalidCount { key: *key }),
        }
    }

    /// Opens an updater applying one batch of transaction `tx_id`.
    ///
    /// Returns `None` when `tx_id` has already been applied, or when the store
    /// awaits a rebuild and has not been started yet; such changes are covered by
    /// the rebuild. Only a batch with `is_last_batch` set records `tx_id` as applied
    /// when closed.
    ///
    /// The returned updater blocks checkpoints until it is closed.
    pub fn updater(&self, tx_id: TxId, is_last_batch: bool) -> Result<Option<CountUpdater<'_>>> {
        self.ensure_open()?;
        let lock_id = self.updater_lock_id();
        let reentrant = ReentryMark::is_held(lock_id);
        // A flush needs the updater lock exclusively, which this thread would block.
        if tx_id.0 % 10 == 0 && !reentrant {
            self.flush_if_needed()?;
        }
        // A thread already holding an updater must not queue behind a waiting
        // checkpoint, which in turn waits for that updater.
        let guard = if reentrant {
            self.lock.read_recursive()
        } else {
            self.lock.read()
        };
        let awaiting_rebuild =
            self.needs_rebuild.load(Ordering::Acquire) && !self.started.load(Ordering::Acquire);
        if self.sequence.is_applied(tx_id) || awaiting_rebuild {
            drop(guard);
            self.metrics.ignored_transaction(tx_id);
            debug!(tx_id = %tx_id, awaiting_rebuild, "counts.updater.ignored");
            return Ok(None);
        }
        let changes = Arc::clone(&self.changes.read());
        Ok(Some(CountUpdater::transactional(
            changes,
            &self.sequence,
            tx_id,
            is_last_batch,
            guard,
            ReentryMark::new(lock_id),
        )))
    }

    fn updater_lock_id(&self) -> usize {
        &self.lock as *const RwLock<()> as usize
    }

    /// Opens a non-transactional updater writing straight into the index.
    ///
    /// With `apply_deltas` the increments are added to the persisted counts;
    /// otherwise they replace them. The updater holds the store exclusively until
    /// it is closed.
    pub fn direct_updater(&self, apply_deltas: bool) -> Result<CountUpdater<'_>> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(CountsError::ReadOnly("direct counts updates"));
        }
        let guard = self.lock.write();
        Ok(CountUpdater::direct(self, apply_deltas, guard))
    }

    /// Merges all applied changes into the index and makes it durable together
    /// with the applied transaction ids. A no-op in read-only mode.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        self.ensure_open()?;
        if self.options.read_only {
            return Ok(CheckpointStats {
                highest_gap_free: self.sequence.highest_gap_free(),
                persisted_keys: self.index.len(),
                ..CheckpointStats::default()
            });
        }
        let serial = self.checkpoint_mutex.lock();
        let exclusive = self.lock.write();
        let (snapshot, merged_keys) = self.switch_and_merge(exclusive)?;
        let header = CountsHeader {
            highest_gap_free: snapshot.highest_gap_free,
            stray_tx_ids: snapshot.out_of_order,
        };
        let prepared = self.index.prepare_checkpoint(&header)?;
        let _durable = self.durable_mutex.lock();
        // Flushes may merge again while the image is written; the image and its
        // header were captured together above.
        drop(serial);
        self.index.commit_checkpoint(prepared)?;
        let stats = CheckpointStats {
            highest_gap_free: header.highest_gap_free,
            stray_tx_ids: header.stray_tx_ids.len(),
            merged_keys,
            persisted_keys: self.index.len(),
        };
        self.metrics.checkpoint(merged_keys);
        debug!(
            highest_gap_free = %stats.highest_gap_free,
            strays = stats.stray_tx_ids,
            merged = stats.merged_keys,
            persisted = stats.persisted_keys,
            "counts.checkpoint.done"
        );
        Ok(stats)
    }

    fn flush_if_needed(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let size = self.changes.read().size();
        if size <= self.options.high_mark() {
            return Ok(());
        }
        let blocking = size > self.options.max_cache_size;
        let _serial = if blocking {
            self.checkpoint_mutex.lock()
        } else {
            match self.checkpoint_mutex.try_lock() {
                Some(guard) => guard,
                None => return Ok(()),
            }
        };
        let exclusive = if blocking {
            self.lock.write()
        } else {
            match self.lock.try_write() {
                Some(guard) => guard,
                None => return Ok(()),
            }
        };
        // A checkpoint may have merged everything while we waited.
        if self.changes.read().size() <= self.options.high_mark() {
            return Ok(());
        }
        let (_, merged_keys) = self.switch_and_merge(exclusive)?;
        self.metrics.cache_flush(merged_keys);
        debug!(size, merged = merged_keys, blocking, "counts.cache.flush");
        Ok(())
    }

    /// Forks the live generation under `exclusive`, then merges the frozen one
    /// while holding the updater lock shared only.
    fn switch_and_merge(
        &self,
        exclusive: RwLockWriteGuard<'_, ()>,
    ) -> Result<(SequenceSnapshot, usize)> {
        let snapshot = self.sequence.snapshot();
        let frozen = {
            let mut view = self.changes.write();
            let frozen = Arc::clone(&view);
            *view = frozen.freeze_and_fork()?;
            frozen
        };
        let _shared = RwLockWriteGuard::downgrade(exclusive);
        let merged_keys = self.merge(&frozen)?;
        Ok((snapshot, merged_keys))
    }

    /// Two-pointer merge of the frozen changes against the ascending index scan.
    fn merge(&self, frozen: &CountsChanges) -> Result<usize> {
        let changes = frozen.sorted_changes(&self.layout);
        let mut stored: Vec<(EncodedKey, i64)> = Vec::with_capacity(self.index.len());
        self.index.scan(&mut |key, value| {
            stored.push((*key, value));
            true
        })?;

        let mut batch = Vec::with_capacity(changes.len());
        let mut stored_iter = stored.iter().peekable();
        for (key, delta) in &changes {
            let encoded = self.layout.encode(key);
            while stored_iter
                .peek()
                .map_or(false, |(k, _)| self.layout.compare_encoded(k, &encoded).is_lt())
            {
                stored_iter.next();
            }
            let existing = match stored_iter.peek() {
                Some((k, v)) if *k == encoded => Some(*v),
                _ => None,
            };
            if let Some(update) = merged_update(key, encoded, existing, *delta)? {
                batch.push(update);
            }
        }

        {
            let view = self.changes.write();
            self.index.apply(&batch)?;
            view.clear_previous();
        }
        Ok(changes.len())
    }

    /// Writes the values accumulated by a direct updater into the index.
    pub(super) fn write_direct_changes(&self, changes: &CountsChanges) -> Result<usize> {
        let sorted = changes.sorted_changes(&self.layout);
        let mut batch = Vec::with_capacity(sorted.len());
        for (key, value) in &sorted {
            let encoded = self.layout.encode(key);
            batch.push(match *value {
                v if v < 0 => {
                    warn!(key = %key, count = v, "counts.direct.negative");
                    IndexUpdate::Put(encoded, INVALID_COUNT)
                }
                0 => IndexUpdate::Remove(encoded),
                v => IndexUpdate::Put(encoded, v),
            });
        }
        let _view = self.changes.write();
        self.index.apply(&batch)?;
        Ok(sorted.len())
    }

    /// Persisted count for `key`, 0 when absent.
    pub(super) fn persisted_count(&self, key: &CountsKey) -> Result<i64> {
        match self.index.get(&self.layout.encode(key))? {
            Some(value) if value < 0 => Err(CountsError::InvalidCount { key: *key }),
            Some(value) => Ok(value),
            None => Ok(0),
        }
    }

    /// Visits every non-zero count in key order.
    ///
    /// Stops with [`CountsError::InvalidCount`] at the first key whose persisted
    /// count is marked invalid or whose combined count is negative; keys before it
    /// have already been visited.
    pub fn visit_all_counts<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&CountsKey, i64),
    {
        self.ensure_open()?;
        let (changes, stored) = {
            let view = self.changes.read();
            let changes = view.sorted_changes(&self.layout);
            let mut stored: Vec<(EncodedKey, i64)> = Vec::with_capacity(self.index.len());
            self.index.scan(&mut |key, value| {
                stored.push((*key, value));
                true
            })?;
            (changes, stored)
        };

        let mut emit = |key: &CountsKey, count: Option<i64>| -> Result<()> {
            match count {
                Some(0) => Ok(()),
                Some(count) if count > 0 => {
                    visitor(key, count);
                    Ok(())
                }
                _ => Err(CountsError::InvalidCount { key: *key }),
            }
        };
        let mut changes = changes.into_iter().peekable();
        for (encoded, persisted) in stored {
            let key = self.layout.decode(&encoded)?;
            while let Some((changed, delta)) = changes.next_if(|(k, _)| *k < key) {
                emit(&changed, Some(delta))?;
            }
            let delta = changes.next_if(|(k, _)| *k == key).map_or(0, |(_, d)| d);
            let count = if persisted < 0 {
                None
            } else {
                persisted.checked_add(delta)
            };
            emit(&key, count)?;
        }
        for (changed, delta) in changes {
            emit(&changed, Some(delta))?;
        }
        Ok(())
    }

    /// Highest gap-free applied transaction id.
    pub fn tx_id(&self) -> TxId {
        self.sequence.highest_gap_free()
    }

    /// Returns true once [`CountsStore::start`] has completed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Waits for open updaters and closes the index without checkpointing.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _durable = self.durable_mutex.lock();
        let _exclusive = self.lock.write();
        self.index.close()
    }
}

/// Index update for one merged key, or `None` when the stored value stays.
fn merged_update(
    key: &CountsKey,
    encoded: EncodedKey,
    existing: Option<i64>,
    delta: i64,
) -> Result<Option<IndexUpdate>> {
    let current = existing.unwrap_or(0);
    if current < 0 {
        return Ok(None);
    }
    let updated = current
        .checked_add(delta)
        .ok_or(CountsError::Invalid("count overflow"))?;
    let update = if updated < 0 {
        warn!(key = %key, count = updated, "counts.merge.negative");
        Some(IndexUpdate::Put(encoded, INVALID_COUNT))
    } else if updated == 0 {
        existing.map(|_| IndexUpdate::Remove(encoded))
    } else if Some(updated) == existing {
        None
    } else {
        Some(IndexUpdate::Put(encoded, updated))
    };
    Ok(update)
}
