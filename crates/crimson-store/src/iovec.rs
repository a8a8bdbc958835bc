//! I/O vectors
//!
//! An `Iovec` is the bulk-data carrier of the store: an ordered map from
//! byte offset to owned buffer. Offsets absent from the map are holes and
//! read as zeros. Buffers are `Bytes`, so sharing page memory with callers
//! is zero-copy and each buffer carries its own release.

use bytes::{Bytes, BytesMut};
use crimson_common::{slice_of_offset, Range, STRIPE_BYTES};
use std::collections::BTreeMap;

/// Hole-aware ordered mapping from offset to owned buffer
#[derive(Clone, Debug, Default)]
pub struct Iovec {
    segments: BTreeMap<u64, Bytes>,
}

impl Iovec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An iovec holding a single buffer at the given offset
    #[must_use]
    pub fn single(offset: u64, data: Bytes) -> Self {
        let mut iov = Self::new();
        iov.insert(offset, data);
        iov
    }

    /// Insert a buffer; the caller keeps buffers non-overlapping
    pub fn insert(&mut self, offset: u64, data: Bytes) {
        if !data.is_empty() {
            self.segments.insert(offset, data);
        }
    }

    /// Absorb all of `other`'s buffers
    pub fn merge(&mut self, other: Iovec) {
        self.segments.extend(other.segments);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of discrete buffers
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total bytes held, not counting holes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.segments.values().map(Bytes::len).sum()
    }

    /// Lowest offset covered
    #[must_use]
    pub fn start(&self) -> Option<u64> {
        self.segments.keys().next().copied()
    }

    /// One past the highest offset covered
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.segments
            .iter()
            .map(|(off, buf)| off + buf.len() as u64)
            .max()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bytes)> {
        self.segments.iter().map(|(&off, buf)| (off, buf))
    }

    /// Flatten the given range into one buffer, reading holes as zeros
    #[must_use]
    pub fn contiguous(&self, range: Range) -> Bytes {
        let mut out = BytesMut::zeroed(range.length as usize);
        for (off, buf) in &self.segments {
            let seg_end = off + buf.len() as u64;
            if seg_end <= range.offset || *off >= range.end() {
                continue;
            }
            let begin = range.offset.max(*off);
            let end = range.end().min(seg_end);
            let src = &buf[(begin - off) as usize..(end - off) as usize];
            out[(begin - range.offset) as usize..(end - range.offset) as usize]
                .copy_from_slice(src);
        }
        out.freeze()
    }

    /// Iterate the contiguous chunks that land on one slice's stripes
    ///
    /// Chunks never cross a stripe boundary; each is yielded with its
    /// absolute byte offset.
    pub(crate) fn stripes(&self, cores: usize, slice: usize) -> Striperator<'_> {
        Striperator {
            segments: self.segments.iter(),
            current: None,
            pos: 0,
            cores,
            slice,
        }
    }
}

impl FromIterator<(u64, Bytes)> for Iovec {
    fn from_iter<T: IntoIterator<Item = (u64, Bytes)>>(iter: T) -> Self {
        let mut iov = Self::new();
        for (off, buf) in iter {
            iov.insert(off, buf);
        }
        iov
    }
}

/// Lazy stripe iterator over an iovec's buffers
pub(crate) struct Striperator<'a> {
    segments: std::collections::btree_map::Iter<'a, u64, Bytes>,
    current: Option<(u64, &'a Bytes)>,
    pos: usize,
    cores: usize,
    slice: usize,
}

impl<'a> Iterator for Striperator<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (off, buf) = match self.current {
                Some(cur) if self.pos < cur.1.len() => cur,
                _ => {
                    let (&off, buf) = self.segments.next()?;
                    self.current = Some((off, buf));
                    self.pos = 0;
                    continue;
                }
            };

            let abs = off + self.pos as u64;
            let to_boundary = STRIPE_BYTES - (abs % STRIPE_BYTES);
            let len = (to_boundary as usize).min(buf.len() - self.pos);
            let start = self.pos;
            self.pos += len;

            if slice_of_offset(abs, self.cores) == self.slice {
                return Some((abs, &buf[start..start + len]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_insert_and_bounds() {
        let mut iov = Iovec::new();
        iov.insert(100, filled(10, 1));
        iov.insert(300, filled(5, 2));
        iov.insert(50, Bytes::new()); // empty buffers are dropped

        assert_eq!(iov.segment_count(), 2);
        assert_eq!(iov.byte_len(), 15);
        assert_eq!(iov.start(), Some(100));
        assert_eq!(iov.end(), Some(305));
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut a = Iovec::single(200, filled(4, 2));
        let b = Iovec::single(100, filled(4, 1));
        a.merge(b);

        let offsets: Vec<u64> = a.iter().map(|(off, _)| off).collect();
        assert_eq!(offsets, vec![100, 200]);
    }

    #[test]
    fn test_contiguous_fills_holes_with_zeros() {
        let mut iov = Iovec::new();
        iov.insert(10, filled(10, 0xAA));
        iov.insert(30, filled(10, 0xBB));

        let flat = iov.contiguous(Range::new(0, 50));
        assert_eq!(flat.len(), 50);
        assert!(flat[..10].iter().all(|&b| b == 0));
        assert!(flat[10..20].iter().all(|&b| b == 0xAA));
        assert!(flat[20..30].iter().all(|&b| b == 0));
        assert!(flat[30..40].iter().all(|&b| b == 0xBB));
        assert!(flat[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_contiguous_clips_segments() {
        let iov = Iovec::single(0, filled(100, 0xCC));
        let flat = iov.contiguous(Range::new(40, 20));
        assert_eq!(flat.len(), 20);
        assert!(flat.iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_striperator_splits_on_stripe_boundaries() {
        // One buffer spanning three stripes: [0, 3*STRIPE_BYTES)
        let len = 3 * STRIPE_BYTES as usize;
        let iov = Iovec::single(0, filled(len, 0x11));

        for slice in 0..3usize {
            let chunks: Vec<(u64, usize)> = iov
                .stripes(3, slice)
                .map(|(off, chunk)| (off, chunk.len()))
                .collect();
            assert_eq!(chunks, vec![(slice as u64 * STRIPE_BYTES, STRIPE_BYTES as usize)]);
        }
    }

    #[test]
    fn test_striperator_unaligned_buffer() {
        // Buffer starting mid-stripe and ending mid-stripe two stripes later.
        let start = STRIPE_BYTES / 2;
        let len = 2 * STRIPE_BYTES as usize;
        let iov = Iovec::single(start, filled(len, 0x22));

        // With two cores, the chunks alternate between slices 0 and 1.
        let slice0: Vec<(u64, usize)> = iov
            .stripes(2, 0)
            .map(|(off, chunk)| (off, chunk.len()))
            .collect();
        let slice1: Vec<(u64, usize)> = iov
            .stripes(2, 1)
            .map(|(off, chunk)| (off, chunk.len()))
            .collect();

        assert_eq!(
            slice0,
            vec![
                (start, (STRIPE_BYTES / 2) as usize),
                (2 * STRIPE_BYTES, (STRIPE_BYTES / 2) as usize),
            ]
        );
        assert_eq!(slice1, vec![(STRIPE_BYTES, STRIPE_BYTES as usize)]);

        let total: usize = slice0.iter().chain(&slice1).map(|(_, l)| l).sum();
        assert_eq!(total, len);
    }

    #[test]
    fn test_striperator_single_core_owns_everything() {
        let mut iov = Iovec::new();
        iov.insert(5, filled(10, 1));
        iov.insert(STRIPE_BYTES + 7, filled(3, 2));

        let total: usize = iov.stripes(1, 0).map(|(_, chunk)| chunk.len()).sum();
        assert_eq!(total, 13);
    }
}
