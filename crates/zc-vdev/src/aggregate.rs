//! Aggregation of adjacent requests into one device operation.
//!
//! The queue decides *which* neighbors join an aggregate; this module holds
//! the geometry: whether a neighbor may join, how the combined write buffer
//! is assembled (members must tile it exactly), and how a combined read is
//! carved back into per-request buffers (holes discarded).

use zc_error::{Result, ZcError};

/// Byte range of one member of an aggregated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

/// Whether `next` may follow `prev_end` in an aggregate starting at `start`.
///
/// The two must not overlap, the hole between them must be at most
/// `max_gap`, and the whole span must stay within `limit`.
#[must_use]
pub fn can_append(start: u64, prev_end: u64, next: Extent, max_gap: u64, limit: u64) -> bool {
    if next.offset < prev_end {
        return false;
    }
    next.offset - prev_end <= max_gap && next.end().saturating_sub(start) <= limit
}

/// Assemble one write buffer covering `base..base+len` from `members`.
///
/// Members must be in ascending order and cover the span with no hole and
/// no overlap; a write never carries bytes no member supplied.
pub fn gather_writes(base: u64, len: u64, members: &[(Extent, &[u8])]) -> Result<Vec<u8>> {
    let size = usize::try_from(len)
        .map_err(|_| ZcError::InvalidArgument(format!("aggregate length {len} too large")))?;
    let mut buf = Vec::with_capacity(size);
    for (extent, data) in members {
        let (start, end) = member_bounds(base, size, *extent)?;
        if start != buf.len() {
            return Err(ZcError::InvalidArgument(format!(
                "member at {} leaves a hole or overlaps at aggregate byte {}",
                extent.offset,
                buf.len()
            )));
        }
        if data.len() != end - start {
            return Err(ZcError::InvalidArgument(format!(
                "member at {} carries {} bytes, expected {}",
                extent.offset,
                data.len(),
                extent.len
            )));
        }
        buf.extend_from_slice(data);
    }
    if buf.len() != size {
        return Err(ZcError::InvalidArgument(format!(
            "members cover {} of {size} aggregate bytes",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Split the result of an aggregated read back into one buffer per member.
///
/// Fails if `data` does not cover every member.
pub fn split_read(base: u64, data: &[u8], members: &[Extent]) -> Result<Vec<Vec<u8>>> {
    members
        .iter()
        .map(|extent| {
            let (start, end) = member_bounds(base, data.len(), *extent)?;
            Ok(data[start..end].to_vec())
        })
        .collect()
}

fn member_bounds(base: u64, total: usize, extent: Extent) -> Result<(usize, usize)> {
    let out_of_span = || {
        ZcError::InvalidArgument(format!(
            "member {}+{} outside aggregate at {base} of {total} bytes",
            extent.offset, extent.len
        ))
    };
    let rel = extent.offset.checked_sub(base).ok_or_else(out_of_span)?;
    let start = usize::try_from(rel).map_err(|_| out_of_span())?;
    let len = usize::try_from(extent.len).map_err(|_| out_of_span())?;
    let end = start.checked_add(len).ok_or_else(out_of_span)?;
    if end > total {
        return Err(out_of_span());
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_respects_gap_overlap_and_limit() {
        // Aggregate so far: 0..4096.
        assert!(can_append(0, 4096, Extent::new(4096, 4096), 0, 8192));
        assert!(can_append(0, 4096, Extent::new(5000, 1000), 1024, 8192));
        assert!(!can_append(0, 4096, Extent::new(6000, 1000), 1024, 8192));
        assert!(!can_append(0, 4096, Extent::new(4000, 512), 1024, 8192));
        assert!(!can_append(0, 4096, Extent::new(4096, 8192), 0, 8192));
    }

    #[test]
    fn gather_concatenates_adjacent_members() {
        let a = [1_u8; 4];
        let b = [2_u8; 2];
        let buf = gather_writes(
            100,
            6,
            &[(Extent::new(100, 4), &a), (Extent::new(104, 2), &b)],
        )
        .expect("gather");
        assert_eq!(buf, vec![1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn gather_refuses_holes() {
        let a = [1_u8; 4];
        let b = [2_u8; 2];
        let err = gather_writes(
            100,
            10,
            &[(Extent::new(100, 4), &a), (Extent::new(108, 2), &b)],
        );
        assert!(matches!(err, Err(ZcError::InvalidArgument(_))));
        // A trailing hole is refused too.
        assert!(gather_writes(0, 8, &[(Extent::new(0, 4), &a)]).is_err());
    }

    #[test]
    fn gather_rejects_length_mismatch() {
        let a = [1_u8; 3];
        assert!(gather_writes(0, 8, &[(Extent::new(0, 4), &a)]).is_err());
    }

    #[test]
    fn split_discards_holes() {
        let data: Vec<u8> = (0..10).collect();
        let parts = split_read(50, &data, &[Extent::new(50, 3), Extent::new(57, 3)]).expect("split");
        assert_eq!(parts, vec![vec![0, 1, 2], vec![7, 8, 9]]);
    }

    #[test]
    fn split_of_short_read_fails() {
        let data = vec![0_u8; 4];
        assert!(split_read(0, &data, &[Extent::new(2, 4)]).is_err());
        assert!(split_read(8, &data, &[Extent::new(4, 1)]).is_err());
    }
}
