//! Partitions a byte range into contiguous cached/remote runs.

use hubmirror_http_range::block_info;

use crate::block_file::{BlockFile, CacheFileError};

/// One contiguous run of `[start, end)` bytes, either fully cached or
/// fully remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub end: u64,
    pub remote: bool,
}

impl Run {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Walks `[lo, hi)` block by block and returns the minimal list of runs
/// whose `remote` flag flips whenever block presence changes. The runs
/// cover the input exactly once, in ascending order, and alternate in
/// `remote`.
pub fn contiguous_runs(
    cache: &BlockFile,
    lo: u64,
    hi: u64,
) -> Result<Vec<Run>, CacheFileError> {
    let block_size = cache.block_size();
    let file_size = cache.file_size();
    let hi = hi.min(file_size);

    let mut runs: Vec<Run> = Vec::new();
    let mut pos = lo;
    while pos < hi {
        let info = block_info(pos, block_size, file_size);
        let remote = !cache.has_block_blocking(info.index)?;
        let end = info.end.min(hi);
        match runs.last_mut() {
            Some(last) if last.remote == remote => last.end = end,
            _ => runs.push(Run {
                start: pos,
                end,
                remote,
            }),
        }
        pos = end;
    }
    Ok(runs)
}
