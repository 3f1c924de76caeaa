use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Byte size classification of a field, a storage strategy or a whole pipe.
///
/// `Fixed(n)` means every value occupies exactly `n` bytes. `Unknown` means
/// the size is only known at runtime, bounded below by `min` and above by
/// `max` when a bound exists. The runtime size itself is computed by the
/// owner of the descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeDescriptor {
    Fixed(u64),
    Unknown { min: u64, max: Option<u64> },
}

impl SizeDescriptor {
    /// An unbounded dynamic size with the given minimum.
    pub const fn unknown(min: u64) -> Self {
        Self::Unknown { min, max: None }
    }

    /// A bounded dynamic size. Collapses to `Fixed` when `min == max`.
    pub const fn bounded(min: u64, max: u64) -> Self {
        if min == max {
            Self::Fixed(min)
        } else {
            Self::Unknown { min, max: Some(max) }
        }
    }

    /// The fixed size, if any.
    pub fn fixed(&self) -> Option<u64> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Unknown { .. } => None,
        }
    }

    /// Returns `true` if the size is fixed.
    pub fn has_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    /// Lower bound.
    pub fn min(&self) -> u64 {
        match self {
            Self::Fixed(n) => *n,
            Self::Unknown { min, .. } => *min,
        }
    }

    /// Upper bound, if one exists.
    pub fn max(&self) -> Option<u64> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Unknown { max, .. } => *max,
        }
    }

    /// Returns `true` if `len` is a size this descriptor allows.
    pub fn contains(&self, len: u64) -> bool {
        len >= self.min() && self.max().map_or(true, |max| len <= max)
    }

    /// Widest descriptor covering both `self` and `other`.
    pub fn union(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        let min = self.min().min(other.min());
        let max = match (self.max(), other.max()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Self::Unknown { min, max }
    }
}

impl Add for SizeDescriptor {
    type Output = SizeDescriptor;

    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Fixed(a), Self::Fixed(b)) => Self::Fixed(a + b),
            (a, b) => Self::Unknown {
                min: a.min() + b.min(),
                max: a.max().zip(b.max()).map(|(x, y)| x + y),
            },
        }
    }
}

impl std::iter::Sum for SizeDescriptor {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SizeDescriptor::Fixed(0), |acc, d| acc + d)
    }
}

impl fmt::Debug for SizeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "Fixed({n})"),
            Self::Unknown { min, max: Some(max) } => write!(f, "Unknown({min}..={max})"),
            Self::Unknown { min, max: None } => write!(f, "Unknown({min}..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_plus_fixed_is_fixed() {
        let sum = SizeDescriptor::Fixed(4) + SizeDescriptor::Fixed(4);
        assert_eq!(sum, SizeDescriptor::Fixed(8));
        assert!(sum.has_fixed());
    }

    #[test]
    fn unknown_is_contagious() {
        let sum = SizeDescriptor::Fixed(4) + SizeDescriptor::unknown(1);
        assert_eq!(sum, SizeDescriptor::Unknown { min: 5, max: None });
        assert!(!sum.has_fixed());
    }

    #[test]
    fn bounded_sums_keep_max() {
        let sum = SizeDescriptor::bounded(1, 9) + SizeDescriptor::Fixed(8);
        assert_eq!(sum.min(), 9);
        assert_eq!(sum.max(), Some(17));
    }

    #[test]
    fn bounded_collapses_to_fixed() {
        assert_eq!(SizeDescriptor::bounded(3, 3), SizeDescriptor::Fixed(3));
    }

    #[test]
    fn contains_checks_bounds() {
        let d = SizeDescriptor::bounded(2, 4);
        assert!(!d.contains(1));
        assert!(d.contains(3));
        assert!(!d.contains(5));
        assert!(SizeDescriptor::unknown(1).contains(u64::MAX));
    }

    #[test]
    fn union_widens() {
        let u = SizeDescriptor::Fixed(2).union(SizeDescriptor::Fixed(6));
        assert_eq!(u, SizeDescriptor::Unknown { min: 2, max: Some(6) });
        let open = u.union(SizeDescriptor::unknown(0));
        assert_eq!(open.max(), None);
    }

    #[test]
    fn sum_of_empty_is_zero() {
        let total: SizeDescriptor = std::iter::empty().sum();
        assert_eq!(total, SizeDescriptor::Fixed(0));
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", SizeDescriptor::Fixed(8)), "Fixed(8)");
        assert_eq!(format!("{:?}", SizeDescriptor::unknown(1)), "Unknown(1..)");
    }
}
