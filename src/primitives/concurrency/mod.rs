#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::types::{CountsError, Result, TxId};

/// Tracks applied transaction ids that may arrive out of order.
///
/// The sequence keeps a gap-free watermark: the highest id `N` such that every id
/// up to and including `N` has been offered. Ids offered above a gap are kept as
/// "stray" ids until the gap closes, at which point the watermark jumps past them.
pub struct OutOfOrderSequence {
    state: Mutex<SequenceState>,
}

#[derive(Debug)]
struct SequenceState {
    highest_gap_free: u64,
    out_of_order: BTreeSet<u64>,
}

/// Point-in-time copy of an [`OutOfOrderSequence`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceSnapshot {
    /// Gap-free watermark.
    pub highest_gap_free: TxId,
    /// Ids recorded above the watermark, ascending.
    pub out_of_order: Vec<TxId>,
}

impl OutOfOrderSequence {
    /// Creates a sequence whose watermark starts at `highest_gap_free`, with the
    /// provided ids already recorded above it.
    pub fn new(highest_gap_free: TxId, out_of_order: &[TxId]) -> Self {
        let seq = Self {
            state: Mutex::new(SequenceState {
                highest_gap_free: highest_gap_free.0,
                out_of_order: BTreeSet::new(),
            }),
        };
        seq.set(highest_gap_free, out_of_order);
        seq
    }

    /// Records `id` as applied. Returns whether the watermark advanced.
    ///
    /// Offering an id that is already covered by the watermark or already recorded
    /// is a sequencing violation.
    pub fn offer(&self, id: TxId) -> Result<bool> {
        let mut state = self.state.lock();
        if id.0 <= state.highest_gap_free || state.out_of_order.contains(&id.0) {
            return Err(CountsError::Sequencing {
                tx_id: id,
                highest_gap_free: TxId(state.highest_gap_free),
            });
        }
        if id.0 != state.highest_gap_free + 1 {
            state.out_of_order.insert(id.0);
            return Ok(false);
        }
        state.highest_gap_free = id.0;
        loop {
            let next = state.highest_gap_free + 1;
            if !state.out_of_order.remove(&next) {
                break;
            }
            state.highest_gap_free = next;
        }
        Ok(true)
    }

    /// Returns true if `id` is at or below the watermark or recorded above it.
    pub fn is_applied(&self, id: TxId) -> bool {
        let state = self.state.lock();
        id.0 <= state.highest_gap_free || state.out_of_order.contains(&id.0)
    }

    /// Returns the gap-free watermark.
    pub fn highest_gap_free(&self) -> TxId {
        TxId(self.state.lock().highest_gap_free)
    }

    /// Replaces the whole state.
    pub fn set(&self, highest_gap_free: TxId, out_of_order: &[TxId]) {
        let mut state = self.state.lock();
        state.highest_gap_free = highest_gap_free.0;
        state.out_of_order.clear();
        for id in out_of_order {
            if id.0 > highest_gap_free.0 {
                state.out_of_order.insert(id.0);
            }
        }
        loop {
            let next = state.highest_gap_free + 1;
            if !state.out_of_order.remove(&next) {
                break;
            }
            state.highest_gap_free = next;
        }
    }

    /// Captures the watermark and stray ids atomically.
    pub fn snapshot(&self) -> SequenceSnapshot {
        let state = self.state.lock();
        SequenceSnapshot {
            highest_gap_free: TxId(state.highest_gap_free),
            out_of_order: state.out_of_order.iter().copied().map(TxId).collect(),
        }
    }
}
