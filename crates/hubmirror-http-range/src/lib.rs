//! Single-range `Range` header parsing and block arithmetic.
//!
//! The mirror serves exactly one byte range per request, so this crate
//! parses the three single-range forms (`bytes=a-b`, `bytes=a-`,
//! `bytes=-k`) and resolves them against a known resource size. The wire
//! form is inclusive-inclusive per HTTP; the resolved form is half-open
//! `[start, end)`, which is what the streaming pipeline and the block
//! container work in.

/// A parsed (unresolved) byte range spec from a `Range` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, both bounds inclusive on the wire.
    FromTo { start: u64, end: u64 },
    /// `bytes=a-`, from `a` to the end of the resource.
    From { start: u64 },
    /// `bytes=-k`, the final `k` bytes of the resource.
    Suffix { len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeParseError {
    /// The spec was empty (`bytes=` or a bare `-`).
    Empty,
    /// A bound contained a non-digit or overflowed `u64`.
    InvalidNumber,
    /// More than one dash-separated spec; multi-range requests are not
    /// served by the mirror.
    MultipleRanges,
    /// `a-b` with `a > b`.
    Inverted,
}

impl std::fmt::Display for RangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeParseError::Empty => write!(f, "empty range spec"),
            RangeParseError::InvalidNumber => write!(f, "invalid number in range spec"),
            RangeParseError::MultipleRanges => write!(f, "multi-range requests are not supported"),
            RangeParseError::Inverted => write!(f, "range start is greater than range end"),
        }
    }
}

impl std::error::Error for RangeParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResolveError {
    /// The spec selects no bytes of a resource of the given size.
    Unsatisfiable,
}

impl std::fmt::Display for RangeResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeResolveError::Unsatisfiable => write!(f, "range is unsatisfiable"),
        }
    }
}

impl std::error::Error for RangeResolveError {}

/// A range resolved against a concrete resource size: half-open
/// `[start, end)` with `start < end <= size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    /// Number of bytes selected. Equals the inclusive wire length
    /// `last - first + 1`.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Parses a `Range` header value into a [`ByteRange`].
///
/// The `bytes=` unit prefix is optional (some clients send the bare
/// `a-b` form back from a `Content-Range` echo), whitespace around
/// tokens is tolerated, leading zeros are accepted, and a trailing
/// `/total` (a `Content-Range` artifact) is stripped.
pub fn parse_range_header(value: &str) -> Result<ByteRange, RangeParseError> {
    let mut spec = value.trim();
    if let Some(rest) = spec.strip_prefix("bytes") {
        let rest = rest.trim_start();
        spec = rest.strip_prefix('=').unwrap_or(rest).trim();
    }
    if let Some((head, _total)) = spec.split_once('/') {
        spec = head.trim();
    }
    if spec.contains(',') {
        return Err(RangeParseError::MultipleRanges);
    }

    let (start_s, end_s) = spec.split_once('-').ok_or(RangeParseError::InvalidNumber)?;
    let start_s = start_s.trim();
    let end_s = end_s.trim();

    match (start_s.is_empty(), end_s.is_empty()) {
        (true, true) => Err(RangeParseError::Empty),
        (false, true) => Ok(ByteRange::From {
            start: parse_bound(start_s)?,
        }),
        (true, false) => Ok(ByteRange::Suffix {
            len: parse_bound(end_s)?,
        }),
        (false, false) => {
            let start = parse_bound(start_s)?;
            let end = parse_bound(end_s)?;
            if start > end {
                return Err(RangeParseError::Inverted);
            }
            Ok(ByteRange::FromTo { start, end })
        }
    }
}

fn parse_bound(s: &str) -> Result<u64, RangeParseError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeParseError::InvalidNumber);
    }
    // Tolerate arbitrarily long zero padding but reject real overflow.
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(|_| RangeParseError::InvalidNumber)
}

impl ByteRange {
    /// Resolves the spec against a resource of `size` bytes.
    ///
    /// The inclusive wire end is clamped to `size - 1`; a start at or
    /// past the end of the resource, a zero-length suffix, or any spec
    /// against an empty resource is unsatisfiable.
    pub fn resolve(self, size: u64) -> Result<ResolvedRange, RangeResolveError> {
        if size == 0 {
            return Err(RangeResolveError::Unsatisfiable);
        }
        let (start, end) = match self {
            ByteRange::FromTo { start, end } => (start, end.min(size - 1) + 1),
            ByteRange::From { start } => (start, size),
            ByteRange::Suffix { len } => {
                if len == 0 {
                    return Err(RangeResolveError::Unsatisfiable);
                }
                (size.saturating_sub(len), size)
            }
        };
        if start >= end {
            return Err(RangeResolveError::Unsatisfiable);
        }
        Ok(ResolvedRange { start, end })
    }
}

/// The block a byte position falls in, with the block's byte extent
/// truncated against the logical file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub index: u64,
    /// First byte offset of the block.
    pub start: u64,
    /// One past the last *valid* byte of the block: `min((index+1)·B, S)`.
    pub end: u64,
}

/// Computes `(block index, block start, block end)` for `pos`.
///
/// `block_size` must be non-zero; `pos` is expected to lie within
/// `[0, file_size)` but the math saturates rather than panics.
pub fn block_info(pos: u64, block_size: u64, file_size: u64) -> BlockInfo {
    debug_assert!(block_size > 0);
    let index = pos / block_size;
    let start = index * block_size;
    let end = start.saturating_add(block_size).min(file_size);
    BlockInfo { index, start, end }
}

/// Number of blocks needed to cover `file_size` bytes.
pub fn block_count(file_size: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    file_size.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_wire_forms() {
        assert_eq!(
            parse_range_header("bytes=0-39"),
            Ok(ByteRange::FromTo { start: 0, end: 39 })
        );
        assert_eq!(
            parse_range_header("bytes=1887436800-"),
            Ok(ByteRange::From {
                start: 1887436800
            })
        );
        assert_eq!(
            parse_range_header("bytes=-10"),
            Ok(ByteRange::Suffix { len: 10 })
        );
    }

    #[test]
    fn unit_prefix_is_optional_and_total_suffix_is_stripped() {
        assert_eq!(
            parse_range_header("5-20"),
            Ok(ByteRange::FromTo { start: 5, end: 20 })
        );
        assert_eq!(
            parse_range_header("bytes=5-20/40"),
            Ok(ByteRange::FromTo { start: 5, end: 20 })
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_range_header("bytes=-"), Err(RangeParseError::Empty));
        assert_eq!(
            parse_range_header("bytes=a-b"),
            Err(RangeParseError::InvalidNumber)
        );
        assert_eq!(
            parse_range_header("bytes=0-1,3-4"),
            Err(RangeParseError::MultipleRanges)
        );
        assert_eq!(
            parse_range_header("bytes=9-3"),
            Err(RangeParseError::Inverted)
        );
    }

    #[test]
    fn resolve_clamps_and_suffixes() {
        let r = ByteRange::FromTo { start: 0, end: 999 }.resolve(40).unwrap();
        assert_eq!((r.start, r.end, r.len()), (0, 40, 40));

        let r = ByteRange::Suffix { len: 10 }.resolve(40).unwrap();
        assert_eq!((r.start, r.end), (30, 40));

        // Oversized suffix selects the whole resource.
        let r = ByteRange::Suffix { len: 100 }.resolve(40).unwrap();
        assert_eq!((r.start, r.end), (0, 40));
    }

    #[test]
    fn resolve_rejects_empty_selections() {
        assert_eq!(
            ByteRange::From { start: 40 }.resolve(40),
            Err(RangeResolveError::Unsatisfiable)
        );
        assert_eq!(
            ByteRange::Suffix { len: 0 }.resolve(40),
            Err(RangeResolveError::Unsatisfiable)
        );
        assert_eq!(
            ByteRange::FromTo { start: 0, end: 0 }.resolve(0),
            Err(RangeResolveError::Unsatisfiable)
        );
    }

    #[test]
    fn inclusive_wire_length_matches_half_open_len() {
        // bytes=5-20 selects 16 bytes.
        let r = parse_range_header("bytes=5-20")
            .unwrap()
            .resolve(40)
            .unwrap();
        assert_eq!(r.len(), 16);
    }

    #[test]
    fn block_info_truncates_the_final_block() {
        let info = block_info(39, 16, 40);
        assert_eq!(info, BlockInfo { index: 2, start: 32, end: 40 });
        let info = block_info(0, 16, 40);
        assert_eq!(info, BlockInfo { index: 0, start: 0, end: 16 });
        assert_eq!(block_count(40, 16), 3);
        assert_eq!(block_count(0, 16), 0);
        assert_eq!(block_count(16, 16), 1);
    }
}
