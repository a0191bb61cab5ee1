use crate::{types::Address, utils::RangeExt};
use core::ops::Range;
use derive_more::Display;

/// Who owns the storage behind a buffer.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Supplied by the caller (host tensors); never reclaimed by the runtime.
    #[display("external")]
    External,
    /// Allocated from the scoped arena at the given scope depth.
    #[display("arena@{_0}")]
    Arena(usize),
}

/// Identity of a buffer: base address, byte size and version.
///
/// `addr` is `None` for a deferred buffer whose storage the runtime allocates
/// when the buffer is first submitted as an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    addr: Option<Address>,
    size: u64,
    version: u32,
    origin: Origin,
}

impl BufferHandle {
    /// A caller-owned buffer at `addr`.
    #[must_use]
    pub const fn external(addr: Address, size: u64) -> Self {
        Self::external_versioned(addr, size, 0)
    }

    /// A caller-owned buffer with an explicit version tag.
    #[must_use]
    pub const fn external_versioned(addr: Address, size: u64, version: u32) -> Self {
        Self {
            addr: if addr == 0 { None } else { Some(addr) },
            size,
            version,
            origin: Origin::External,
        }
    }

    /// A buffer without storage yet. Submitting it as an output allocates it
    /// from the arena.
    #[must_use]
    pub const fn deferred(size: u64) -> Self {
        Self {
            addr: None,
            size,
            version: 0,
            origin: Origin::External,
        }
    }

    pub(crate) const fn arena(addr: Address, size: u64, version: u32, depth: usize) -> Self {
        Self {
            addr: Some(addr),
            size,
            version,
            origin: Origin::Arena(depth),
        }
    }

    /// Base address, `None` while deferred.
    #[must_use]
    pub const fn addr(&self) -> Option<Address> {
        self.addr
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Version tag distinguishing successive occupants of the same storage.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Owner of the storage.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether the runtime must allocate storage for this buffer.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.addr.is_none()
    }
}

/// Multi-dimensional strided view into a buffer.
///
/// `shape` and `strides` are in elements, `offset` in bytes from the buffer
/// base. For dependency inference a view is reduced to its bounding byte range,
/// which may claim bytes the view skips over but never misses a byte it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StridedView {
    /// Byte offset of the first element.
    pub offset: u64,
    /// Extent of every dimension.
    pub shape: Vec<u64>,
    /// Distance between consecutive elements of every dimension, in elements.
    pub strides: Vec<u64>,
    /// Element size in bytes.
    pub elem_size: u64,
}

impl StridedView {
    /// Smallest byte range containing every element of the view.
    #[must_use]
    pub fn bounding_range(&self) -> Range<u64> {
        assert_eq!(
            self.shape.len(),
            self.strides.len(),
            "StridedView::bounding_range: shape/strides rank mismatch"
        );
        if self.elem_size == 0 || self.shape.contains(&0) {
            return self.offset..self.offset;
        }
        // Saturation only ever widens the range.
        let last = self
            .shape
            .iter()
            .zip(&self.strides)
            .fold(0u64, |acc, (&extent, &stride)| {
                acc.saturating_add((extent - 1).saturating_mul(stride))
            });
        let end = self
            .offset
            .saturating_add(last.saturating_mul(self.elem_size))
            .saturating_add(self.elem_size);
        self.offset..end
    }
}

/// How a parameter touches its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read, then write in place.
    ReadWrite,
}

impl Access {
    /// Whether the access observes the previous contents.
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether the access modifies the contents.
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Ordering conflict between an earlier and a later access to aliasing bytes.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// The later task reads what the earlier one wrote.
    #[display("RAW")]
    ReadAfterWrite,
    /// Both tasks write; the later write must land last.
    #[display("WAW")]
    WriteAfterWrite,
    /// The later task overwrites what the earlier one still reads.
    #[display("WAR")]
    WriteAfterRead,
}

impl Hazard {
    /// Hazard class between two accesses, `None` for read/read.
    #[must_use]
    pub const fn classify(earlier: Access, later: Access) -> Option<Self> {
        if earlier.writes() && later.reads() {
            Some(Self::ReadAfterWrite)
        } else if earlier.writes() && later.writes() {
            Some(Self::WriteAfterWrite)
        } else if earlier.reads() && later.writes() {
            Some(Self::WriteAfterRead)
        } else {
            None
        }
    }
}

/// Versioned absolute byte range, the unit of dependency inference.
///
/// Regions alias when their absolute byte ranges intersect, whichever buffer
/// they were derived from, so a sub-buffer and its parent are ordered like any
/// two views of the same storage. The only exception is two occupants of the
/// same base address with different versions, which never alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    /// Base address of the buffer the region was derived from.
    pub key: Address,
    /// Absolute byte range.
    pub range: Range<u64>,
    /// Version of the buffer occupant.
    pub version: u32,
}

impl Region {
    /// Region spanning all of `buffer`, `None` while the buffer is deferred.
    #[must_use]
    pub fn whole(buffer: &BufferHandle) -> Option<Self> {
        let addr = buffer.addr()?;
        Some(Self {
            key: addr,
            range: addr..addr.saturating_add(buffer.size()),
            version: buffer.version(),
        })
    }

    /// Region covering the bounding range of a strided view of `buffer`.
    #[must_use]
    pub fn of_view(buffer: &BufferHandle, view: &StridedView) -> Option<Self> {
        let addr = buffer.addr()?;
        let bounds = view.bounding_range();
        Some(Self {
            key: addr,
            range: addr.saturating_add(bounds.start)..addr.saturating_add(bounds.end),
            version: buffer.version(),
        })
    }

    /// Whether `self` and `other` may describe the same occupant's bytes.
    fn same_generation(&self, other: &Self) -> bool {
        self.key != other.key || self.version == other.version
    }

    /// Whether the regions share at least one byte of the same occupant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.same_generation(other) && self.range.intersects(&other.range)
    }

    /// Whether `self` contains every byte of `other` (same occupant).
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.same_generation(other) && self.range.covers(&other.range)
    }

    /// Hazard between an earlier access to `self` and a later access to
    /// `later_region`, or `None` if they do not alias or only read.
    #[must_use]
    pub fn hazard(&self, earlier: Access, later_region: &Self, later: Access) -> Option<Hazard> {
        if self.overlaps(later_region) {
            Hazard::classify(earlier, later)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(key: Address, range: Range<u64>, version: u32) -> Region {
        Region {
            key,
            range: key + range.start..key + range.end,
            version,
        }
    }

    #[test]
    fn stale_versions_never_alias() {
        let old = region(0x1000, 0..64, 1);
        let new = region(0x1000, 0..64, 2);
        assert!(!old.overlaps(&new));
        assert_eq!(old.hazard(Access::Write, &new, Access::Read), None);
    }

    #[test]
    fn hazard_classes() {
        let a = region(0x1000, 0..64, 0);
        let b = region(0x1000, 32..96, 0);
        assert_eq!(
            a.hazard(Access::Write, &b, Access::Read),
            Some(Hazard::ReadAfterWrite)
        );
        assert_eq!(
            a.hazard(Access::Write, &b, Access::Write),
            Some(Hazard::WriteAfterWrite)
        );
        assert_eq!(
            a.hazard(Access::Read, &b, Access::Write),
            Some(Hazard::WriteAfterRead)
        );
        assert_eq!(
            a.hazard(Access::ReadWrite, &b, Access::ReadWrite),
            Some(Hazard::ReadAfterWrite)
        );
        assert_eq!(a.hazard(Access::Read, &b, Access::Read), None);
    }

    #[test]
    fn disjoint_ranges_and_buffers() {
        let a = region(0x1000, 0..64, 0);
        assert!(!a.overlaps(&region(0x1000, 64..128, 0)));
        assert!(!a.overlaps(&region(0x2000, 0..64, 0)));
    }

    #[test]
    fn sub_buffers_alias_their_parent() {
        let whole = Region::whole(&BufferHandle::external(0x1000, 256)).expect("addressed");
        let sub = Region::whole(&BufferHandle::external(0x1080, 64)).expect("addressed");
        assert_eq!(sub.range, 0x1080..0x10c0);
        assert!(whole.overlaps(&sub));
        assert!(whole.covers(&sub));
        assert!(!sub.covers(&whole));
        assert_eq!(
            whole.hazard(Access::Write, &sub, Access::Read),
            Some(Hazard::ReadAfterWrite)
        );
        let tail = Region::whole(&BufferHandle::external(0x1100, 64)).expect("addressed");
        assert!(!whole.overlaps(&tail));
    }

    #[test]
    fn views_are_placed_at_the_buffer_address() {
        let buffer = BufferHandle::external(0x4000, 256);
        let view = StridedView {
            offset: 64,
            shape: vec![4],
            strides: vec![2],
            elem_size: 4,
        };
        let region = Region::of_view(&buffer, &view).expect("addressed");
        assert_eq!(region.range, 0x4040..0x405c);
    }

    #[test]
    fn strided_view_bounds_all_elements() {
        // 4x3 block of f32 inside a row-major 4x8 matrix, starting at column 2.
        let view = StridedView {
            offset: 2 * 4,
            shape: vec![4, 3],
            strides: vec![8, 1],
            elem_size: 4,
        };
        // Last element: row 3, column 4 => element 28 => bytes 112..116.
        assert_eq!(view.bounding_range(), 8..116);
    }

    #[test]
    fn empty_view_covers_nothing() {
        let view = StridedView {
            offset: 16,
            shape: vec![0, 8],
            strides: vec![8, 1],
            elem_size: 4,
        };
        let buffer = BufferHandle::external(0x4000, 256);
        let empty = Region::of_view(&buffer, &view).expect("addressed");
        assert!(!empty.overlaps(&Region::whole(&buffer).expect("addressed")));
    }

    #[test]
    fn null_external_address_is_deferred() {
        assert!(BufferHandle::external(0, 16).is_deferred());
        assert_eq!(Region::whole(&BufferHandle::deferred(16)), None);
    }
}
