// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;

use bitvec::bitvec;
use bitvec::vec::BitVec;

use super::p2_roundup;
use crate::storage::{StorageResult, TracedStorageError};

/// Deterministic first-fit allocator over fixed-size units.
///
/// Given the same sequence of `allocate`/`free` calls, offsets are
/// reproducible. The allocator keeps a span map besides the bitmap so that
/// `free` can reject ranges that were never handed out, while still
/// accepting partial frees produced by extent repair.
pub struct BitmapAllocator {
    /// Byte offset of the managed region inside the segment file.
    base: u64,
    /// Unit size in bytes, power of two.
    unit: u64,
    /// One bit per unit, set when allocated.
    bitmap: BitVec,
    /// Allocated spans: start unit -> unit count.
    spans: BTreeMap<u64, u64>,
}

impl BitmapAllocator {
    pub fn new(base: u64, unit: u32, units: u64) -> Self {
        Self {
            base,
            unit: unit as u64,
            bitmap: bitvec![0; units as usize],
            spans: BTreeMap::new(),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.bitmap.len() as u64 * self.unit
    }

    pub fn in_use_bytes(&self) -> u64 {
        self.bitmap.count_ones() as u64 * self.unit
    }

    /// Allocate room for `bytes`, rounded up to whole units. Returns the
    /// byte offset and the rounded length.
    pub fn allocate(&mut self, bytes: u64) -> StorageResult<(u64, u64)> {
        let want = (p2_roundup(bytes.max(1), self.unit) / self.unit) as usize;
        let mut run = 0usize;
        let mut start = 0usize;
        for (idx, used) in self.bitmap.iter().by_vals().enumerate() {
            if used {
                run = 0;
                start = idx + 1;
            } else {
                run += 1;
                if run == want {
                    for i in start..start + want {
                        self.bitmap.set(i, true);
                    }
                    self.spans.insert(start as u64, want as u64);
                    return Ok((
                        self.base + start as u64 * self.unit,
                        want as u64 * self.unit,
                    ));
                }
            }
        }
        Err(TracedStorageError::out_of_space(bytes))
    }

    /// Release `[offset, offset + bytes)`. Zero-length frees are a no-op.
    /// The range must lie within a span previously handed out by
    /// [`BitmapAllocator::allocate`]; partially freed spans shrink and only
    /// the fully covered units are reclaimed.
    pub fn free(&mut self, offset: u64, bytes: u64) -> StorageResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let rel = offset
            .checked_sub(self.base)
            .ok_or_else(|| TracedStorageError::invalid_extent(offset, bytes))?;
        let first_unit = rel / self.unit;
        // the span containing the start of the freed range
        let (&span_start, &span_len) = self
            .spans
            .range(..=first_unit)
            .next_back()
            .ok_or_else(|| TracedStorageError::invalid_extent(offset, bytes))?;
        let span_end = span_start + span_len;
        let end_unit = (rel + bytes).div_ceil(self.unit);
        if first_unit >= span_end || end_unit > span_end {
            return Err(TracedStorageError::invalid_extent(offset, bytes));
        }

        // reclaim only whole units covered by the freed byte range
        let full_first = rel.div_ceil(self.unit).max(span_start);
        let full_end = ((rel + bytes) / self.unit).min(span_end);
        if full_first >= full_end {
            // the range touches no whole unit; bookkeeping is unchanged
            return Ok(());
        }
        for i in full_first..full_end {
            self.bitmap.set(i as usize, false);
        }

        self.spans.remove(&span_start);
        if span_start < full_first {
            self.spans.insert(span_start, full_first - span_start);
        }
        if full_end < span_end {
            self.spans.insert(full_end, span_end - full_end);
        }
        Ok(())
    }

    /// Re-mark a span as allocated during replay. Overlapping replays of the
    /// same span are tolerated.
    pub fn restore(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let rel = offset.saturating_sub(self.base);
        let first = (rel / self.unit) as usize;
        let end = ((rel + bytes).div_ceil(self.unit) as usize).min(self.bitmap.len());
        for i in first..end {
            self.bitmap.set(i, true);
        }
        let start_unit = first as u64;
        let units = (end - first) as u64;
        let merged = match self.spans.get(&start_unit) {
            Some(&existing) => existing.max(units),
            None => units,
        };
        self.spans.insert(start_unit, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> BitmapAllocator {
        BitmapAllocator::new(8192, 4096, 16)
    }

    #[test]
    fn deterministic_offsets() {
        let run = || {
            let mut a = alloc();
            let x = a.allocate(100).unwrap();
            let y = a.allocate(5000).unwrap();
            a.free(x.0, x.1).unwrap();
            let z = a.allocate(100).unwrap();
            (x, y, z)
        };
        assert_eq!(run(), run());
        let (x, y, z) = run();
        assert_eq!(x, (8192, 4096));
        assert_eq!(y, (8192 + 4096, 8192));
        // freed head is reused first
        assert_eq!(z, (8192, 4096));
    }

    #[test]
    fn out_of_space() {
        let mut a = alloc();
        a.allocate(15 * 4096).unwrap();
        let err = a.allocate(2 * 4096).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::storage::StorageError::OutOfSpace(_)
        ));
        // one unit still fits
        a.allocate(1).unwrap();
    }

    #[test]
    fn free_validates_spans() {
        let mut a = alloc();
        let (off, len) = a.allocate(4096).unwrap();
        // zero-length free of anything is a no-op
        a.free(12345, 0).unwrap();
        // never-allocated range is rejected
        let err = a.free(off + len, 4096).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::storage::StorageError::InvalidExtent(_, _)
        ));
        a.free(off, len).unwrap();
        // double free is rejected
        assert!(a.free(off, len).is_err());
    }

    #[test]
    fn partial_free_shrinks_span() {
        let mut a = alloc();
        let (off, _) = a.allocate(4 * 4096).unwrap();
        // free the middle two units
        a.free(off + 4096, 2 * 4096).unwrap();
        // the freed hole is reusable
        let (again, len) = a.allocate(2 * 4096).unwrap();
        assert_eq!((again, len), (off + 4096, 2 * 4096));
    }

    #[test]
    fn restore_marks_units() {
        let mut a = alloc();
        a.restore(8192, 4096 * 2);
        let (off, _) = a.allocate(1).unwrap();
        assert_eq!(off, 8192 + 2 * 4096);
        a.free(8192, 4096 * 2).unwrap();
    }
}
