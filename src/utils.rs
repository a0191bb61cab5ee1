use core::ops::Range;

pub(crate) trait RangeExt {
    fn intersects(&self, other: &Self) -> bool;
    fn covers(&self, other: &Self) -> bool;
}

impl RangeExt for Range<u64> {
    #[inline]
    fn intersects(&self, other: &Self) -> bool {
        // Empty ranges never intersect anything, including themselves.
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    #[inline]
    fn covers(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two(), "align_up: [1]");
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_is_half_open() {
        assert!((0..8).intersects(&(7..9)));
        assert!(!(0..8).intersects(&(8..9)));
        assert!(!(0..0).intersects(&(0..4)));
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 64), Some(64));
        assert_eq!(align_up(128, 64), Some(128));
        assert_eq!(align_up(u64::MAX, 64), None);
    }
}
