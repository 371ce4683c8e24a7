//! Transactional counts: key layout, delta generations, updaters and the store.

mod changes;
mod key;
mod rebuild;
mod store;
mod updater;

pub use changes::{CountsChanges, ABSENT};
pub use key::{
    node_key, relationship_key, CountsKey, EncodedKey, KeyLayout, ANY_LABEL,
    ANY_RELATIONSHIP_TYPE, KEY_LEN,
};
pub use rebuild::{EmptyRebuild, Rebuilder, EMPTY_REBUILD};
pub use store::{CheckpointStats, CountsStore, NEEDS_REBUILDING_HIGH_ID};
pub use updater::CountUpdater;
