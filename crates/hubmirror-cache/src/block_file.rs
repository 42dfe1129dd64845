//! The on-disk block container.
//!
//! One container file holds one remote resource: a fixed 36-byte header,
//! the block presence bitset, then `N` fixed-size block slots. All numeric
//! header fields are little-endian unsigned.
//!
//! ```text
//! offset  size       field
//! 0       4          magic "OLAH"
//! 4       8          version
//! 12      8          block_size (B)
//! 20      8          file_size  (S, logical resource size)
//! 28      8          mask_bits  (M, bit capacity of the presence map)
//! 36      ceil(M/8)  block mask
//! ...     N*B        block slots, N = ceil(S/B)
//! ```
//!
//! The final block is logically `S mod B` bytes; its slot is still `B`
//! bytes on disk and the tail reads back as zeros. Only blocks whose mask
//! bit is set hold authoritative bytes.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::bitset::{Bitset, BitsetError};

pub const CACHE_FILE_MAGIC: &[u8; 4] = b"OLAH";
pub const CACHE_FILE_VERSION: u64 = 8;
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
/// Bit capacity of the presence map; fixed at create time.
pub const BLOCK_MASK_BITS: u64 = 1 << 20;

const HEADER_FIX_SIZE: usize = 36;

#[derive(Debug, Error)]
pub enum CacheFileError {
    #[error("container is closed")]
    NotOpen,
    #[error("block index {index} out of range ({count} blocks)")]
    BadIndex { index: u64, count: u64 },
    #[error("not a cache container file")]
    BadMagic,
    #[error("container version {found} is incompatible with supported version {expected}")]
    BadVersion { found: u64, expected: u64 },
    #[error("file size {file_size} exceeds container capacity ({mask_bits} blocks of {block_size} bytes)")]
    Capacity {
        file_size: u64,
        mask_bits: u64,
        block_size: u64,
    },
    #[error("block buffer length {got} does not match block size {expected}")]
    SizeMismatch { got: usize, expected: u64 },
    #[error("container may not shrink from {current} to {requested} bytes")]
    ShrinkRejected { current: u64, requested: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<BitsetError> for CacheFileError {
    fn from(err: BitsetError) -> Self {
        match err {
            BitsetError::OutOfRange { index, capacity } => CacheFileError::BadIndex {
                index,
                count: capacity,
            },
            BitsetError::LengthMismatch { .. } => CacheFileError::BadMagic,
        }
    }
}

#[derive(Debug, Clone)]
struct Header {
    version: u64,
    block_size: u64,
    file_size: u64,
    mask_bits: u64,
    mask: Bitset,
}

impl Header {
    fn new(block_size: u64) -> Self {
        Self {
            version: CACHE_FILE_VERSION,
            block_size,
            file_size: 0,
            mask_bits: BLOCK_MASK_BITS,
            mask: Bitset::new(BLOCK_MASK_BITS),
        }
    }

    fn block_count(&self) -> u64 {
        self.file_size.div_ceil(self.block_size)
    }

    fn size_on_disk(&self) -> u64 {
        HEADER_FIX_SIZE as u64 + self.mask.as_bytes().len() as u64
    }

    fn validate(&self) -> Result<(), CacheFileError> {
        if self.version != CACHE_FILE_VERSION {
            return Err(CacheFileError::BadVersion {
                found: self.version,
                expected: CACHE_FILE_VERSION,
            });
        }
        // N <= M, equivalently S <= M * B.
        if self.file_size > self.mask_bits.saturating_mul(self.block_size) {
            return Err(CacheFileError::Capacity {
                file_size: self.file_size,
                mask_bits: self.mask_bits,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mask = self.mask.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_FIX_SIZE + mask.len());
        buf.extend_from_slice(CACHE_FILE_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf.extend_from_slice(&self.mask_bits.to_le_bytes());
        buf.extend_from_slice(mask);
        buf
    }

    fn read_from(file: &std::fs::File) -> Result<Self, CacheFileError> {
        let mut fixed = [0u8; HEADER_FIX_SIZE];
        file.read_exact_at(&mut fixed, 0)
            .map_err(|_| CacheFileError::BadMagic)?;
        if &fixed[0..4] != CACHE_FILE_MAGIC {
            return Err(CacheFileError::BadMagic);
        }
        let version = u64::from_le_bytes(fixed[4..12].try_into().unwrap());
        let block_size = u64::from_le_bytes(fixed[12..20].try_into().unwrap());
        let file_size = u64::from_le_bytes(fixed[20..28].try_into().unwrap());
        let mask_bits = u64::from_le_bytes(fixed[28..36].try_into().unwrap());
        if version != CACHE_FILE_VERSION {
            return Err(CacheFileError::BadVersion {
                found: version,
                expected: CACHE_FILE_VERSION,
            });
        }
        if block_size == 0 {
            return Err(CacheFileError::BadMagic);
        }
        let mut mask_bytes = vec![0u8; mask_bits.div_ceil(8) as usize];
        file.read_exact_at(&mut mask_bytes, HEADER_FIX_SIZE as u64)
            .map_err(|_| CacheFileError::BadMagic)?;
        let header = Self {
            version,
            block_size,
            file_size,
            mask_bits,
            mask: Bitset::from_bytes(mask_bits, mask_bytes)?,
        };
        header.validate()?;
        Ok(header)
    }
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    file: std::fs::File,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    header: Header,
    open: bool,
}

/// Handle to an on-disk block container. Cheap to clone; all clones share
/// the same file handle and header state.
#[derive(Clone, Debug)]
pub struct BlockFile {
    inner: Arc<Inner>,
}

impl BlockFile {
    /// Opens an existing container or creates a new one with
    /// `block_size_hint` as its block size. The hint is ignored when the
    /// file already exists (the block size is fixed at create time).
    pub fn open(path: impl AsRef<Path>, block_size_hint: u64) -> Result<Self, CacheFileError> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let header = if exists {
            Header::read_from(&file)?
        } else {
            let header = Header::new(block_size_hint);
            file.write_all_at(&header.to_bytes(), 0)?;
            header
        };
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                file,
                state: Mutex::new(State { header, open: true }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// A non-owning handle, used by the container registry to observe
    /// whether any request still holds this container open.
    pub fn downgrade(&self) -> WeakBlockFile {
        WeakBlockFile(Arc::downgrade(&self.inner))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Header mutations never panic while holding the lock.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn block_size(&self) -> u64 {
        self.lock().header.block_size
    }

    pub fn file_size(&self) -> u64 {
        self.lock().header.file_size
    }

    pub fn block_count(&self) -> u64 {
        self.lock().header.block_count()
    }

    /// Grows the logical file size. Shrinking is rejected; growing past
    /// the mask capacity fails with [`CacheFileError::Capacity`]. Extends
    /// the file so every slot physically exists (sparse zeros), then
    /// flushes the header.
    pub fn resize_blocking(&self, file_size: u64) -> Result<(), CacheFileError> {
        let (header_bytes, total_len) = {
            let mut state = self.lock();
            if !state.open {
                return Err(CacheFileError::NotOpen);
            }
            let current = state.header.file_size;
            if file_size < current {
                return Err(CacheFileError::ShrinkRejected {
                    current,
                    requested: file_size,
                });
            }
            state.header.file_size = file_size;
            if let Err(err) = state.header.validate() {
                state.header.file_size = current;
                return Err(err);
            }
            let total = state.header.size_on_disk()
                + state.header.block_count() * state.header.block_size;
            (state.header.to_bytes(), total)
        };
        self.inner.file.set_len(total_len)?;
        self.inner.file.write_all_at(&header_bytes, 0)?;
        Ok(())
    }

    /// Whether block `index` holds authoritative bytes. `false` for
    /// indices at or past the block count.
    pub fn has_block_blocking(&self, index: u64) -> Result<bool, CacheFileError> {
        let state = self.lock();
        if !state.open {
            return Err(CacheFileError::NotOpen);
        }
        if index >= state.header.block_count() {
            return Ok(false);
        }
        Ok(state.header.mask.test(index)?)
    }

    /// Reads block `index`: always exactly `block_size` bytes (the short
    /// final block comes back zero-padded), or `None` when the block has
    /// not been written.
    pub fn read_block_blocking(&self, index: u64) -> Result<Option<Bytes>, CacheFileError> {
        let (offset, block_size) = {
            let state = self.lock();
            if !state.open {
                return Err(CacheFileError::NotOpen);
            }
            let count = state.header.block_count();
            if index >= count {
                return Err(CacheFileError::BadIndex { index, count });
            }
            if !state.header.mask.test(index)? {
                return Ok(None);
            }
            (
                state.header.size_on_disk() + index * state.header.block_size,
                state.header.block_size,
            )
        };
        let mut buf = vec![0u8; block_size as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.inner.file.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                // Slot tail past EOF reads as zeros; buf is already zeroed.
                break;
            }
            read += n;
        }
        Ok(Some(Bytes::from(buf)))
    }

    /// Writes block `index` from a buffer of exactly `block_size` bytes.
    /// For the final block only the valid `S mod B` tail is persisted;
    /// the slot's zero padding comes from the sparse resize. Sets the
    /// mask bit and flushes the header. Idempotent.
    pub fn write_block_blocking(&self, index: u64, data: &[u8]) -> Result<(), CacheFileError> {
        let (offset, valid_len) = {
            let state = self.lock();
            if !state.open {
                return Err(CacheFileError::NotOpen);
            }
            let header = &state.header;
            if data.len() as u64 != header.block_size {
                return Err(CacheFileError::SizeMismatch {
                    got: data.len(),
                    expected: header.block_size,
                });
            }
            let count = header.block_count();
            if index >= count {
                return Err(CacheFileError::BadIndex { index, count });
            }
            let block_start = index * header.block_size;
            let valid = (header.file_size - block_start).min(header.block_size);
            (header.size_on_disk() + block_start, valid as usize)
        };
        self.inner.file.write_all_at(&data[..valid_len], offset)?;
        let header_bytes = {
            let mut state = self.lock();
            if !state.open {
                return Err(CacheFileError::NotOpen);
            }
            state.header.mask.set(index)?;
            state.header.to_bytes()
        };
        self.inner.file.write_all_at(&header_bytes, 0)?;
        Ok(())
    }

    /// Rewrites the header (including the mask) to disk.
    pub fn flush_blocking(&self) -> Result<(), CacheFileError> {
        let header_bytes = {
            let state = self.lock();
            if !state.open {
                return Err(CacheFileError::NotOpen);
            }
            state.header.to_bytes()
        };
        self.inner.file.write_all_at(&header_bytes, 0)?;
        Ok(())
    }

    /// Flushes the header and marks the handle closed. Further operations
    /// fail with [`CacheFileError::NotOpen`].
    pub fn close(&self) -> Result<(), CacheFileError> {
        self.flush_blocking()?;
        self.lock().open = false;
        Ok(())
    }

    pub async fn resize(&self, file_size: u64) -> Result<(), CacheFileError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.resize_blocking(file_size))
            .await
            .map_err(join_error)?
    }

    pub async fn read_block(&self, index: u64) -> Result<Option<Bytes>, CacheFileError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_block_blocking(index))
            .await
            .map_err(join_error)?
    }

    pub async fn write_block(&self, index: u64, data: Bytes) -> Result<(), CacheFileError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.write_block_blocking(index, &data))
            .await
            .map_err(join_error)?
    }

    pub async fn flush(&self) -> Result<(), CacheFileError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.flush_blocking())
            .await
            .map_err(join_error)?
    }
}

/// Non-owning counterpart of [`BlockFile`].
#[derive(Clone)]
pub struct WeakBlockFile(std::sync::Weak<Inner>);

impl WeakBlockFile {
    pub fn upgrade(&self) -> Option<BlockFile> {
        self.0.upgrade().map(|inner| BlockFile { inner })
    }
}

fn join_error(err: tokio::task::JoinError) -> CacheFileError {
    CacheFileError::Io(std::io::Error::other(err))
}
