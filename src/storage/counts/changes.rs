use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHasher};

use crate::types::{CountsError, Result};

use super::key::{CountsKey, KeyLayout};

/// Returned by [`CountsChanges::get`] when no generation in the chain holds a change.
pub const ABSENT: i64 = i64::MIN;

const SHARD_COUNT: usize = 16;

/// One generation of count changes accumulated since the last merge.
///
/// Writers go through sharded locks so increments of the same key are serialized
/// while different keys proceed independently. A generation produced by
/// [`CountsChanges::freeze_and_fork`] reads through to its frozen parent until the
/// parent is merged and detached with [`CountsChanges::clear_previous`].
pub struct CountsChanges {
    shards: Box<[Mutex<FxHashMap<CountsKey, i64>>]>,
    frozen: AtomicBool,
    previous: RwLock<Option<Arc<CountsChanges>>>,
}

impl Default for CountsChanges {
    fn default() -> Self {
        Self::new()
    }
}

impl CountsChanges {
    /// Creates an empty, writable generation with no parent.
    pub fn new() -> Self {
        Self::with_previous(None)
    }

    fn with_previous(previous: Option<Arc<CountsChanges>>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            frozen: AtomicBool::new(false),
            previous: RwLock::new(previous),
        }
    }

    fn shard_for(&self, key: &CountsKey) -> &Mutex<FxHashMap<CountsKey, i64>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Accumulated change for `key` across this generation and its parent, or
    /// [`ABSENT`] if neither holds one.
    pub fn get(&self, key: &CountsKey) -> i64 {
        let own = self.shard_for(key).lock().get(key).copied();
        let inherited = match self.previous.read().as_ref() {
            Some(previous) => previous.get(key),
            None => ABSENT,
        };
        match (own, inherited) {
            (None, inherited) => inherited,
            (Some(value), ABSENT) => value,
            (Some(value), inherited) => value + inherited,
        }
    }

    /// Returns true if this generation or its parent holds a change for `key`.
    pub fn contains_change(&self, key: &CountsKey) -> bool {
        if self.shard_for(key).lock().contains_key(key) {
            return true;
        }
        match self.previous.read().as_ref() {
            Some(previous) => previous.contains_change(key),
            None => false,
        }
    }

    /// Adds `delta` to the change for `key`, seeding a missing entry from
    /// `stored_lookup` first.
    ///
    /// Returns true when the accumulated value moved to or from exactly zero.
    pub fn add<F>(&self, key: &CountsKey, delta: i64, stored_lookup: F) -> Result<bool>
    where
        F: FnOnce(&CountsKey) -> Result<i64>,
    {
        let mut shard = self.shard_for(key).lock();
        if self.frozen.load(Ordering::SeqCst) {
            return Err(CountsError::Invalid(
                "counts changes generation is frozen",
            ));
        }
        let before = match shard.get(key) {
            Some(value) => *value,
            None => stored_lookup(key)?,
        };
        let after = before
            .checked_add(delta)
            .ok_or(CountsError::Invalid("count overflow"))?;
        shard.insert(*key, after);
        Ok((before == 0) != (after == 0))
    }

    /// Freezes this generation and returns a fresh writable one reading through to it.
    ///
    /// Every `add` that returned before this call is part of the frozen state; every
    /// `add` racing with or following it fails.
    pub fn freeze_and_fork(self: &Arc<Self>) -> Result<Arc<CountsChanges>> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(CountsError::Invalid(
                "counts changes generation already frozen",
            ));
        }
        // Drain writers that passed the frozen check before the swap.
        for shard in self.shards.iter() {
            drop(shard.lock());
        }
        Ok(Arc::new(CountsChanges::with_previous(Some(Arc::clone(self)))))
    }

    /// Returns true once [`CountsChanges::freeze_and_fork`] has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Drops the link to the frozen parent after it has been merged.
    pub fn clear_previous(&self) {
        *self.previous.write() = None;
    }

    /// Number of keys changed in this generation, parent excluded.
    pub fn size(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// All changes of the chain summed per key, ordered by `layout`.
    pub fn sorted_changes(&self, layout: &KeyLayout) -> Vec<(CountsKey, i64)> {
        let mut merged: FxHashMap<CountsKey, i64> = FxHashMap::default();
        if let Some(previous) = self.previous.read().as_ref() {
            for (key, value) in previous.sorted_changes(layout) {
                merged.insert(key, value);
            }
        }
        for shard in self.shards.iter() {
            for (key, value) in shard.lock().iter() {
                *merged.entry(*key).or_insert(0) += *value;
            }
        }
        let mut sorted: Vec<_> = merged.into_iter().collect();
        sorted.sort_unstable_by(|a, b| layout.compare(&a.0, &b.0));
        sorted
    }
}
