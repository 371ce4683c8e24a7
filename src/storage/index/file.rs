#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

use crate::primitives::bytes::ord;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::counts::{EncodedKey, KeyLayout, KEY_LEN};
use crate::types::{image_crc32, CountsError, Result, TxId};

use super::{CountsHeader, CountsIndex, IndexUpdate, PreparedCheckpoint, INVALID_COUNT};

/// Leading bytes of every counts image.
pub const IMAGE_MAGIC: [u8; 4] = *b"CNTS";
/// Version of the image layout written by this build.
pub const FORMAT_VERSION: u16 = 1;
/// Size of the fixed image header.
pub const HEADER_LEN: usize = 64;

const ENTRY_LEN: usize = KEY_LEN + 8;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_FORMAT_VERSION: Range<usize> = 4..6;
const HDR_RESERVED: Range<usize> = 6..8;
const HDR_SALT: Range<usize> = 8..16;
const HDR_HIGHEST_GAP_FREE: Range<usize> = 16..24;
const HDR_STRAY_COUNT: Range<usize> = 24..28;
const HDR_CRC32: Range<usize> = 28..32;
const HDR_ENTRY_COUNT: Range<usize> = 32..40;
const HDR_RESERVED_2: Range<usize> = 40..HEADER_LEN;

/// File-backed [`CountsIndex`].
///
/// Entries live in an ordered in-memory map. A checkpoint serializes the map and
/// the header into one checksummed image, writes it next to the target file,
/// syncs it and renames it into place, so the file always holds either the
/// previous or the new image.
pub struct FileCountsIndex {
    path: PathBuf,
    salt: u64,
    read_only: bool,
    sync: bool,
    state: RwLock<IndexState>,
}

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<EncodedKey, i64>,
    header: Option<CountsHeader>,
    closed: bool,
}

struct DecodedImage {
    salt: u64,
    header: CountsHeader,
    entries: BTreeMap<EncodedKey, i64>,
}

impl FileCountsIndex {
    /// Opens the counts file at `path`.
    ///
    /// A writable open creates a missing file; an empty file yields an index with
    /// no header. A read-only open of a missing file fails with
    /// [`CountsError::NotFound`]. Damaged images fail with
    /// [`CountsError::Corruption`].
    pub fn open(path: impl AsRef<Path>, read_only: bool, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = if read_only {
            StdFileIo::open_read_only(&path)?
        } else {
            StdFileIo::open(&path)?
        };
        let len = io.len()? as usize;
        let (salt, state) = if len == 0 {
            (OsRng.next_u64(), IndexState::default())
        } else {
            let mut buf = vec![0u8; len];
            io.read_at(0, &mut buf)?;
            let image = decode_image(&buf)?;
            debug!(
                path = %path.display(),
                entries = image.entries.len(),
                highest_gap_free = %image.header.highest_gap_free,
                "counts.index.open"
            );
            (
                image.salt,
                IndexState {
                    entries: image.entries,
                    header: Some(image.header),
                    closed: false,
                },
            )
        };
        Ok(Self {
            path,
            salt,
            read_only,
            sync,
            state: RwLock::new(state),
        })
    }

    /// Path of the counts file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_image(&self, image: &[u8]) -> Result<()> {
        let tmp = self.tmp_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let io = StdFileIo::new(file);
        io.write_at(0, image)?;
        if self.sync {
            io.sync_all()?;
        }
        drop(io);
        fs::rename(&tmp, &self.path)?;
        if self.sync {
            sync_parent_dir(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn ensure_open(state: &IndexState) -> Result<()> {
    if state.closed {
        return Err(CountsError::Invalid("counts index closed"));
    }
    Ok(())
}

impl CountsIndex for FileCountsIndex {
    fn get(&self, key: &EncodedKey) -> Result<Option<i64>> {
        let state = self.state.read();
        ensure_open(&state)?;
        Ok(state.entries.get(key).copied())
    }

    fn scan(&self, visitor: &mut dyn FnMut(&EncodedKey, i64) -> bool) -> Result<()> {
        let entries: Vec<(EncodedKey, i64)> = {
            let state = self.state.read();
            ensure_open(&state)?;
            state.entries.iter().map(|(k, v)| (*k, *v)).collect()
        };
        for (key, value) in &entries {
            if !visitor(key, *value) {
                break;
            }
        }
        Ok(())
    }

    fn apply(&self, updates: &[IndexUpdate]) -> Result<()> {
        let mut state = self.state.write();
        ensure_open(&state)?;
        for update in updates {
            match *update {
                IndexUpdate::Put(key, value) => {
                    state.entries.insert(key, value);
                }
                IndexUpdate::Remove(key) => {
                    state.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        ensure_open(&state)?;
        state.entries.clear();
        state.header = None;
        Ok(())
    }

    fn header(&self) -> Option<CountsHeader> {
        self.state.read().header.clone()
    }

    fn prepare_checkpoint(&self, header: &CountsHeader) -> Result<PreparedCheckpoint> {
        if self.read_only {
            return Err(CountsError::ReadOnly("checkpoint of counts index"));
        }
        let state = self.state.read();
        ensure_open(&state)?;
        Ok(PreparedCheckpoint {
            header: header.clone(),
            image: encode_image(self.salt, header, &state.entries),
        })
    }

    fn commit_checkpoint(&self, prepared: PreparedCheckpoint) -> Result<()> {
        if self.read_only {
            return Err(CountsError::ReadOnly("checkpoint of counts index"));
        }
        ensure_open(&self.state.read())?;
        self.write_image(&prepared.image)?;
        let header = prepared.header;
        debug!(
            path = %self.path.display(),
            bytes = prepared.image.len(),
            highest_gap_free = %header.highest_gap_free,
            strays = header.stray_tx_ids.len(),
            "counts.index.checkpoint"
        );
        self.state.write().header = Some(header);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.closed = true;
        state.entries.clear();
        Ok(())
    }
}

fn encode_image(salt: u64, header: &CountsHeader, entries: &BTreeMap<EncodedKey, i64>) -> Vec<u8> {
    let strays = &header.stray_tx_ids;
    let mut buf = vec![0u8; HEADER_LEN + strays.len() * 8 + entries.len() * ENTRY_LEN];
    buf[HDR_MAGIC].copy_from_slice(&IMAGE_MAGIC);
    buf[HDR_FORMAT_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf[HDR_RESERVED].fill(0);
    ord::put_u64_be(&mut buf[HDR_SALT], salt);
    ord::put_u64_be(&mut buf[HDR_HIGHEST_GAP_FREE], header.highest_gap_free.0);
    ord::put_u32_be(&mut buf[HDR_STRAY_COUNT], strays.len() as u32);
    ord::put_u64_be(&mut buf[HDR_ENTRY_COUNT], entries.len() as u64);
    buf[HDR_RESERVED_2].fill(0);

    let mut off = HEADER_LEN;
    for id in strays {
        ord::put_u64_be(&mut buf[off..off + 8], id.0);
        off += 8;
    }
    for (key, value) in entries {
        buf[off..off + KEY_LEN].copy_from_slice(key);
        ord::put_i64_be(&mut buf[off + KEY_LEN..off + ENTRY_LEN], *value);
        off += ENTRY_LEN;
    }

    let crc = image_crc32(salt, FORMAT_VERSION, &buf);
    buf[HDR_CRC32].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode_image(buf: &[u8]) -> Result<DecodedImage> {
    if buf.len() < HEADER_LEN {
        return Err(CountsError::Corruption("counts image truncated"));
    }
    if buf[HDR_MAGIC] != IMAGE_MAGIC {
        return Err(CountsError::Corruption("counts image magic mismatch"));
    }
    let version = u16::from_be_bytes([buf[HDR_FORMAT_VERSION.start], buf[HDR_FORMAT_VERSION.start + 1]]);
    if version != FORMAT_VERSION {
        return Err(CountsError::Corruption("counts image format version unsupported"));
    }
    if buf[HDR_RESERVED].iter().any(|b| *b != 0) || buf[HDR_RESERVED_2].iter().any(|b| *b != 0) {
        return Err(CountsError::Corruption("counts image reserved field non-zero"));
    }
    let salt = ord::get_u64_be(&buf[HDR_SALT]);
    let stored_crc = ord::get_u32_be(&buf[HDR_CRC32]);
    let mut scratch = buf.to_vec();
    scratch[HDR_CRC32].fill(0);
    if image_crc32(salt, version, &scratch) != stored_crc {
        return Err(CountsError::Corruption("counts image crc mismatch"));
    }

    let highest_gap_free = TxId(ord::get_u64_be(&buf[HDR_HIGHEST_GAP_FREE]));
    let stray_count = ord::get_u32_be(&buf[HDR_STRAY_COUNT]) as usize;
    let entry_count = ord::get_u64_be(&buf[HDR_ENTRY_COUNT]) as usize;
    let expected = stray_count
        .checked_mul(8)
        .and_then(|s| entry_count.checked_mul(ENTRY_LEN).and_then(|e| s.checked_add(e)))
        .and_then(|body| body.checked_add(HEADER_LEN));
    if expected != Some(buf.len()) {
        return Err(CountsError::Corruption("counts image length mismatch"));
    }

    let mut off = HEADER_LEN;
    let mut stray_tx_ids = Vec::with_capacity(stray_count);
    let mut floor = highest_gap_free;
    for _ in 0..stray_count {
        let id = TxId(ord::get_u64_be(&buf[off..off + 8]));
        if id <= floor {
            return Err(CountsError::Corruption("counts stray ids out of order"));
        }
        stray_tx_ids.push(id);
        floor = id;
        off += 8;
    }

    let layout = KeyLayout;
    let mut entries = BTreeMap::new();
    let mut prev: Option<EncodedKey> = None;
    for _ in 0..entry_count {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[off..off + KEY_LEN]);
        layout.decode(&key)?;
        if let Some(prev) = prev {
            if layout.compare_encoded(&prev, &key).is_ge() {
                return Err(CountsError::Corruption("counts keys out of order"));
            }
        }
        let value = ord::get_i64_be(&buf[off + KEY_LEN..off + ENTRY_LEN]);
        if value < INVALID_COUNT {
            return Err(CountsError::Corruption("counts value negative"));
        }
        entries.insert(key, value);
        prev = Some(key);
        off += ENTRY_LEN;
    }

    Ok(DecodedImage {
        salt,
        header: CountsHeader {
            highest_gap_free,
            stray_tx_ids,
        },
        entries,
    })
}
