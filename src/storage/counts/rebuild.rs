use crate::types::{Result, TxId, BASE_TX_ID};

use super::updater::CountUpdater;

/// Re-derives every count from the authoritative data when the persisted counts
/// cannot be trusted.
pub trait Rebuilder: Send + Sync {
    /// Id of the last transaction committed to the authoritative data.
    fn last_committed_tx_id(&self) -> TxId;

    /// Writes the absolute count of every known key through `updater`.
    fn rebuild(&self, updater: &mut CountUpdater<'_>) -> Result<()>;
}

/// [`Rebuilder`] for an empty database: nothing committed beyond [`BASE_TX_ID`]
/// and no counts to write.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyRebuild;

impl Rebuilder for EmptyRebuild {
    fn last_committed_tx_id(&self) -> TxId {
        BASE_TX_ID
    }

    fn rebuild(&self, _updater: &mut CountUpdater<'_>) -> Result<()> {
        Ok(())
    }
}

/// Shorthand for an [`EmptyRebuild`] value.
pub const EMPTY_REBUILD: EmptyRebuild = EmptyRebuild;
