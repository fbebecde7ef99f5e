//! Half-open ranges of the global shot clock.

use std::fmt;
use std::ops::Range;

/// A half-open range `[from, to)` of shot counters.
///
/// One clock is shared by every channel of a buffer set, so a single range describes
/// what is resident across all enabled channels at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ShotRange {
    /// First shot of the range (inclusive).
    pub from: u64,
    /// End of the range (exclusive).
    pub to: u64,
}

impl ShotRange {
    /// Create a range. An inverted range is normalised to the empty range at `to`.
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            from: from.min(to),
            to,
        }
    }

    /// Number of shots in the range.
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    /// True if the range holds no shot.
    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }

    /// Whether `shot` lies inside the range.
    pub fn contains(&self, shot: u64) -> bool {
        self.from <= shot && shot < self.to
    }

    /// The part of the range at or after `start`.
    pub fn starting_at(&self, start: u64) -> ShotRange {
        ShotRange::new(self.from.max(start), self.to)
    }

    /// Iterate over the shot counters.
    pub fn shots(&self) -> Range<u64> {
        self.from..self.to
    }
}

impl fmt::Display for ShotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_range_is_empty() {
        let range = ShotRange::new(10, 4);
        assert!(range.is_empty());
        assert_eq!(range.to, 4);
    }

    #[test]
    fn test_starting_at_clamps_both_ways() {
        let range = ShotRange::new(5, 9);
        assert_eq!(range.starting_at(2), ShotRange::new(5, 9));
        assert_eq!(range.starting_at(7), ShotRange::new(7, 9));
        assert!(range.starting_at(12).is_empty());
        assert_eq!(range.to_string(), "[5, 9)");
    }
}
