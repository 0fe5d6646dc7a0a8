//! Copy-free addressing of remote binary regions.
//!
//! This module provides:
//! - `Location`: an opaque handle naming a region owned by a data provider.
//! - `Extent`: a contiguous byte range inside that region.
//! - `DataDescriptor`: a location plus the ordered extents it selects, with
//!   `sub_view`, `stride_view` and `unstructured_view` composing new
//!   descriptors without touching any data.
//!
//! Views are expressed relative to the descriptor they are taken from. A
//! view of a view is flattened back onto the underlying region, so a data
//! provider only ever needs `location()` and `extents()` to resolve a
//! transfer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FluxError, Result};

/// Most extents a strided view may produce.
pub const MAX_EXTENTS: u64 = 1 << 20;

/// Opaque provider-specific handle for a stored region.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(Vec<u8>);

impl Location {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Location(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({})", hex::encode(&self.0))
    }
}

/// A contiguous range `[offset, offset + len)` of the underlying region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Addressing value for zero or more bytes stored out of line.
///
/// A descriptor never owns memory. Cloning it is cheap relative to the
/// data it addresses and two descriptors are equal when they name the same
/// location, size and byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataDescriptor {
    location: Location,
    extents: Vec<Extent>,
    size: u64,
}

impl DataDescriptor {
    /// Descriptor covering the first `size` bytes of `location`.
    pub fn new(location: Location, size: u64) -> Self {
        let extents = if size == 0 {
            Vec::new()
        } else {
            vec![Extent { offset: 0, len: size }]
        };
        DataDescriptor {
            location,
            extents,
            size,
        }
    }

    /// The empty descriptor: no location, no bytes.
    pub fn null() -> Self {
        DataDescriptor::default()
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Byte ranges of the underlying region, in view order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Selects `[offset, offset + size)` of this view.
    pub fn sub_view(&self, offset: u64, size: u64) -> Result<DataDescriptor> {
        self.check_bounds(offset, size)?;
        Ok(self.select([(offset, size)]))
    }

    /// Selects `block_count` blocks of `block_size` bytes, each followed by
    /// `gap_size` skipped bytes, starting at `offset`.
    ///
    /// Gapless strides collapse to a single range. A gapped stride of more
    /// than `MAX_EXTENTS` blocks is refused with `InvalidArgument`.
    pub fn stride_view(
        &self,
        offset: u64,
        block_count: u64,
        block_size: u64,
        gap_size: u64,
    ) -> Result<DataDescriptor> {
        if block_count == 0 || block_size == 0 {
            self.check_bounds(offset, 0)?;
            return Ok(self.select(std::iter::empty()));
        }
        let stride = block_size.checked_add(gap_size);
        let span = stride
            .and_then(|s| s.checked_mul(block_count - 1))
            .and_then(|s| s.checked_add(block_size));
        let Some((stride, span)) = stride.zip(span) else {
            return Err(self.out_of_range(offset, u64::MAX));
        };
        self.check_bounds(offset, span)?;

        if gap_size == 0 {
            return Ok(self.select([(offset, span)]));
        }
        if block_count > MAX_EXTENTS {
            return Err(FluxError::InvalidArgument(format!(
                "stride view of {block_count} separate blocks exceeds the limit of {MAX_EXTENTS}"
            )));
        }
        Ok(self.select((0..block_count).map(|i| (offset + i * stride, block_size))))
    }

    /// Selects an arbitrary set of `(offset, size)` ranges, returned in
    /// ascending offset order. Ranges must not overlap.
    pub fn unstructured_view<I>(&self, segments: I) -> Result<DataDescriptor>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut ranges: Vec<(u64, u64)> = segments.into_iter().filter(|(_, len)| *len > 0).collect();
        ranges.sort_unstable_by_key(|(offset, _)| *offset);

        let mut previous_end = 0u64;
        for (i, &(offset, len)) in ranges.iter().enumerate() {
            self.check_bounds(offset, len)?;
            if i > 0 && offset < previous_end {
                return Err(FluxError::InvalidArgument(format!(
                    "segment at offset {offset} overlaps the previous segment ending at {previous_end}"
                )));
            }
            previous_end = offset + len;
        }
        Ok(self.select(ranges))
    }

    fn check_bounds(&self, offset: u64, size: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(self.out_of_range(offset, size)),
        }
    }

    fn out_of_range(&self, offset: u64, size: u64) -> FluxError {
        FluxError::OutOfRange {
            offset,
            size,
            bound: self.size,
        }
    }

    /// Maps sorted, disjoint, in-bounds view ranges onto the region.
    fn select<I>(&self, ranges: I) -> DataDescriptor
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut out: Vec<Extent> = Vec::new();
        let mut idx = 0usize;
        // View offset at which `self.extents[idx]` begins.
        let mut extent_start = 0u64;

        for (offset, len) in ranges {
            let mut cursor = offset;
            let mut remaining = len;
            while remaining > 0 {
                while let Some(e) = self.extents.get(idx) {
                    if extent_start + e.len > cursor {
                        break;
                    }
                    extent_start += e.len;
                    idx += 1;
                }
                let Some(e) = self.extents.get(idx) else {
                    break;
                };
                let within = cursor - extent_start;
                let take = remaining.min(e.len - within);
                push_merged(
                    &mut out,
                    Extent {
                        offset: e.offset + within,
                        len: take,
                    },
                );
                cursor += take;
                remaining -= take;
            }
        }

        let size = out.iter().map(|e| e.len).sum();
        DataDescriptor {
            location: self.location.clone(),
            extents: out,
            size,
        }
    }
}

fn push_merged(out: &mut Vec<Extent>, next: Extent) {
    if let Some(last) = out.last_mut() {
        if last.end() == next.offset {
            last.len += next.len;
            return;
        }
    }
    out.push(next);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    fn alphabet() -> DataDescriptor {
        DataDescriptor::new(Location::new(b"mem:0".to_vec()), ALPHABET.len() as u64)
    }

    /// Resolves a descriptor against an in-memory region.
    fn read(region: &[u8], d: &DataDescriptor) -> Vec<u8> {
        d.extents()
            .iter()
            .flat_map(|e| region[e.offset as usize..e.end() as usize].iter().copied())
            .collect()
    }

    #[test]
    fn sub_view_selects_contiguous_range() {
        let d = alphabet().sub_view(4, 8).expect("in bounds");
        assert_eq!(d.size(), 8);
        assert_eq!(read(ALPHABET, &d), b"EFGHIJKL");
    }

    #[test]
    fn stride_view_skips_gaps() {
        let d = alphabet().stride_view(1, 5, 2, 3).expect("in bounds");
        assert_eq!(d.size(), 10);
        assert_eq!(read(ALPHABET, &d), b"BCGHLMQRVW");
        assert_eq!(d.extents().len(), 5);
    }

    #[test]
    fn stride_without_gap_collapses_to_one_extent() {
        let d = alphabet().stride_view(2, 4, 3, 0).expect("in bounds");
        assert_eq!(d.extents(), &[Extent { offset: 2, len: 12 }]);
    }

    #[test]
    fn huge_strides_stay_compact() {
        let big = DataDescriptor::new(Location::new(b"mem:1".to_vec()), 1 << 40);
        let gapless = big.stride_view(8, 1 << 32, 1, 0).expect("in bounds");
        assert_eq!(gapless.extents(), &[Extent { offset: 8, len: 1 << 32 }]);
        assert_eq!(gapless.size(), 1 << 32);

        assert!(matches!(
            big.stride_view(0, 1 << 32, 1, 1),
            Err(FluxError::InvalidArgument(_))
        ));
        let at_limit = big.stride_view(0, MAX_EXTENTS, 1, 1).expect("at the limit");
        assert_eq!(at_limit.extents().len() as u64, MAX_EXTENTS);
    }

    #[test]
    fn views_compose() {
        let strided = alphabet().stride_view(1, 5, 2, 3).expect("in bounds");
        // "BCGHLMQRVW" -> "HLMQ"
        let sub = strided.sub_view(3, 4).expect("in bounds");
        assert_eq!(read(ALPHABET, &sub), b"HLMQ");
        assert_eq!(sub.location(), alphabet().location());

        // "HLMQ" -> every other byte
        let again = sub.stride_view(0, 2, 1, 1).expect("in bounds");
        assert_eq!(read(ALPHABET, &again), b"HM");
    }

    #[test]
    fn unstructured_view_orders_segments() {
        let d = alphabet()
            .unstructured_view([(14, 2), (1, 3), (7, 5)])
            .expect("in bounds");
        assert_eq!(read(ALPHABET, &d), b"BCDHIJKLOP");
    }

    #[test]
    fn unstructured_view_rejects_overlap() {
        let err = alphabet()
            .unstructured_view([(1, 5), (3, 2)])
            .expect_err("overlap");
        assert!(matches!(err, FluxError::InvalidArgument(_)));
    }

    #[test]
    fn out_of_range_views_fail() {
        let d = alphabet();
        assert!(matches!(
            d.sub_view(20, 7),
            Err(FluxError::OutOfRange { bound: 26, .. })
        ));
        assert!(matches!(
            d.stride_view(1, 6, 2, 3),
            Err(FluxError::OutOfRange { .. })
        ));
        assert!(matches!(
            d.sub_view(u64::MAX, 2),
            Err(FluxError::OutOfRange { .. })
        ));
        assert!(matches!(
            d.stride_view(0, u64::MAX, u64::MAX, 1),
            Err(FluxError::OutOfRange { .. })
        ));
    }

    #[test]
    fn empty_views_keep_location() {
        let d = alphabet().stride_view(26, 0, 4, 1).expect("empty is valid");
        assert!(d.is_empty());
        assert_eq!(d.location(), alphabet().location());
        assert!(DataDescriptor::null().is_empty());
        assert!(DataDescriptor::null().location().is_empty());
    }

    #[test]
    fn equality_considers_selected_bytes() {
        let a = alphabet().sub_view(0, 4).expect("in bounds");
        let b = alphabet().sub_view(4, 4).expect("in bounds");
        assert_eq!(a.size(), b.size());
        assert_ne!(a, b);
        assert_eq!(a, alphabet().sub_view(0, 4).expect("in bounds"));
    }

    proptest! {
        #[test]
        fn prop_sub_view_size_and_region(offset in 0u64..26, len in 0u64..26) {
            prop_assume!(offset + len <= 26);
            let d = alphabet().sub_view(offset, len).expect("in bounds");
            prop_assert_eq!(d.size(), len);
            prop_assert_eq!(
                read(ALPHABET, &d),
                ALPHABET[offset as usize..(offset + len) as usize].to_vec()
            );
        }

        #[test]
        fn prop_stride_view_size(offset in 0u64..26, n in 1u64..8, b in 1u64..6, g in 0u64..4) {
            let span = (n - 1) * (b + g) + b;
            let result = alphabet().stride_view(offset, n, b, g);
            if offset + span <= 26 {
                let d = result.expect("in bounds");
                prop_assert_eq!(d.size(), n * b);
            } else {
                let is_out_of_range = matches!(result, Err(FluxError::OutOfRange { .. }));
                prop_assert!(is_out_of_range);
            }
        }
    }
}
