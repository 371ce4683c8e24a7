use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

use crate::primitives::concurrency::OutOfOrderSequence;
use crate::types::{Result, TxId};

use super::changes::CountsChanges;
use super::key::CountsKey;
use super::store::CountsStore;

/// Handle through which count changes are applied.
///
/// Transactional updaters hold the store's updater lock shared and add deltas to
/// the live generation; closing the last batch of a transaction records its id.
/// Direct updaters hold the lock exclusively and write their accumulated values
/// into the index when closed.
///
/// Dropping an open updater closes it; errors on that path are logged.
pub struct CountUpdater<'a> {
    writer: Option<Writer<'a>>,
}

enum Writer<'a> {
    Transactional {
        changes: Arc<CountsChanges>,
        sequence: &'a OutOfOrderSequence,
        tx_id: TxId,
        is_last_batch: bool,
        _guard: RwLockReadGuard<'a, ()>,
        _reentry: ReentryMark,
    },
    Direct {
        store: &'a CountsStore,
        changes: CountsChanges,
        apply_deltas: bool,
        _guard: RwLockWriteGuard<'a, ()>,
    },
}

impl<'a> CountUpdater<'a> {
    pub(super) fn transactional(
        changes: Arc<CountsChanges>,
        sequence: &'a OutOfOrderSequence,
        tx_id: TxId,
        is_last_batch: bool,
        guard: RwLockReadGuard<'a, ()>,
        reentry: ReentryMark,
    ) -> Self {
        Self {
            writer: Some(Writer::Transactional {
                changes,
                sequence,
                tx_id,
                is_last_batch,
                _guard: guard,
                _reentry: reentry,
            }),
        }
    }

    pub(super) fn direct(
        store: &'a CountsStore,
        apply_deltas: bool,
        guard: RwLockWriteGuard<'a, ()>,
    ) -> Self {
        Self {
            writer: Some(Writer::Direct {
                store,
                changes: CountsChanges::new(),
                apply_deltas,
                _guard: guard,
            }),
        }
    }

    /// Adds `delta` to the count for `key`.
    ///
    /// Returns true when the value accumulated by this writer moved to or from
    /// exactly zero.
    ///
    /// # Panics
    ///
    /// Panics if the updater has been closed.
    pub fn increment(&mut self, key: &CountsKey, delta: i64) -> Result<bool> {
        match self.writer.as_ref() {
            Some(Writer::Transactional { changes, .. }) => changes.add(key, delta, |_| Ok(0)),
            Some(Writer::Direct {
                store,
                changes,
                apply_deltas,
                ..
            }) => {
                if *apply_deltas {
                    changes.add(key, delta, |k| store.persisted_count(k))
                } else {
                    changes.add(key, delta, |_| Ok(0))
                }
            }
            None => panic!("increment on a closed count updater"),
        }
    }

    /// Transaction id this updater applies, `None` for direct updaters.
    pub fn tx_id(&self) -> Option<TxId> {
        match self.writer.as_ref() {
            Some(Writer::Transactional { tx_id, .. }) => Some(*tx_id),
            _ => None,
        }
    }

    /// Returns true once [`CountUpdater::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Finishes the updater and releases the store lock. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            None => Ok(()),
            Some(Writer::Transactional {
                sequence,
                tx_id,
                is_last_batch,
                ..
            }) => {
                if is_last_batch {
                    sequence.offer(tx_id)?;
                }
                Ok(())
            }
            Some(Writer::Direct { store, changes, .. }) => {
                store.write_direct_changes(&changes).map(|_| ())
            }
        }
    }
}

thread_local! {
    static HELD_UPDATER_LOCKS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Records that the current thread holds a store's updater lock shared.
///
/// Lives as long as the transactional updater's guard. Guards are not `Send`, so
/// the mark is always dropped on the thread that created it.
pub(super) struct ReentryMark {
    lock: usize,
}

impl ReentryMark {
    pub(super) fn new(lock: usize) -> Self {
        HELD_UPDATER_LOCKS.with(|held| held.borrow_mut().push(lock));
        Self { lock }
    }

    /// Returns true when the current thread holds an updater on `lock`.
    pub(super) fn is_held(lock: usize) -> bool {
        HELD_UPDATER_LOCKS.with(|held| held.borrow().contains(&lock))
    }
}

impl Drop for ReentryMark {
    fn drop(&mut self) {
        HELD_UPDATER_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|l| *l == self.lock) {
                held.swap_remove(pos);
            }
        });
    }
}

impl Drop for CountUpdater<'_> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.close() {
                error!(error = %err, "counts.updater.close_failed");
            }
        }
    }
}

impl fmt::Debug for CountUpdater<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.writer.as_ref() {
            Some(Writer::Transactional { .. }) => "transactional",
            Some(Writer::Direct { .. }) => "direct",
            None => "closed",
        };
        f.debug_struct("CountUpdater")
            .field("kind", &kind)
            .field("tx_id", &self.tx_id())
            .finish()
    }
}
