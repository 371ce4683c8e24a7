use std::io::Write;
use std::path::Path;

use crate::storage::{CountsIndex, FileCountsIndex, KeyLayout, NEEDS_REBUILDING_HIGH_ID};
use crate::types::{CountsError, TxId};

use super::error::{AdminError, Result};

/// Summary of a [`dump`] run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpReport {
    /// Watermark stored in the file header.
    pub highest_gap_free: TxId,
    /// Stray transaction ids stored in the file header.
    pub stray_tx_ids: Vec<TxId>,
    /// Number of count lines written.
    pub entries: usize,
}

/// Writes the contents of the counts file at `path` to `out`.
///
/// The first line is `Highest gap-free txId: N`, followed by one
/// `<key> = <count>` line per stored key in index order. The file is opened
/// read-only; a missing file is reported and never created.
pub fn dump(path: impl AsRef<Path>, out: &mut dyn Write) -> Result<DumpReport> {
    let path = path.as_ref();
    let index = match FileCountsIndex::open(path, true, false) {
        Ok(index) => index,
        Err(CountsError::NotFound) => return Err(AdminError::missing_store(path)),
        Err(err) => return Err(err.into()),
    };
    let header = index.header();
    let highest_gap_free = header
        .as_ref()
        .map_or(NEEDS_REBUILDING_HIGH_ID, |h| h.highest_gap_free);

    let mut entries = Vec::with_capacity(index.len());
    index.scan(&mut |key, count| {
        entries.push((*key, count));
        true
    })?;

    writeln!(out, "Highest gap-free txId: {}", highest_gap_free)?;
    let layout = KeyLayout;
    for (encoded, count) in &entries {
        let key = layout.decode(encoded)?;
        writeln!(out, "{} = {}", key, count)?;
    }
    out.flush()?;
    Ok(DumpReport {
        highest_gap_free,
        stray_tx_ids: header.map(|h| h.stray_tx_ids).unwrap_or_default(),
        entries: entries.len(),
    })
}
