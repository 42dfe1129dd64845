//! On-disk cache primitives for the hub mirror.
//!
//! A remote file is stored as a [`BlockFile`]: a fixed header, a block
//! presence [`Bitset`], and `N` fixed-size block slots. The rest of the
//! crate covers the supporting pieces the streaming pipeline leans on —
//! the cache directory layout, persisted response [`Envelope`]s, the
//! cached/remote run partitioner, and the [`DiskReaper`] that keeps the
//! cache root under its size limit.

pub mod bitset;
pub mod block_file;
pub mod envelope;
pub mod paths;
pub mod reaper;
pub mod registry;
pub mod runs;

pub use bitset::{Bitset, BitsetError};
pub use block_file::{
    BlockFile, CacheFileError, BLOCK_MASK_BITS, CACHE_FILE_MAGIC, CACHE_FILE_VERSION,
    DEFAULT_BLOCK_SIZE,
};
pub use envelope::{Envelope, EnvelopeError};
pub use paths::{clean_path_component, make_parent_dirs, CacheLayout, RepoCoord, RepoType};
pub use reaper::{
    folder_total_size, parse_size_limit, touch_access_time, CleanStrategy, DiskReaper,
    ReapStats, ReaperConfig,
};
pub use registry::ContainerRegistry;
pub use runs::{contiguous_runs, Run};
