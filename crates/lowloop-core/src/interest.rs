//! Readiness interest bitmask.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Requested (or reported) readiness for one descriptor.
///
/// Requests replace the previous mask; they never accumulate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);
    /// Error / hang-up. Always reported, requesting it only matters when
    /// neither READ nor WRITE is set.
    pub const ERROR: Interest = Interest(4);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Interest(bits & 7)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & 2 != 0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & 4 != 0
    }

    #[inline]
    pub fn with(self, other: Interest, on: bool) -> Interest {
        if on {
            self | other
        } else {
            self & !other
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;
    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    #[inline]
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl Not for Interest {
    type Output = Interest;
    #[inline]
    fn not(self) -> Interest {
        Interest(!self.0 & 7)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut parts = Vec::with_capacity(3);
        if self.is_readable() {
            parts.push("READ");
        }
        if self.is_writable() {
            parts.push("WRITE");
        }
        if self.is_error() {
            parts.push("ERROR");
        }
        f.write_str(&parts.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_ops() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.contains(Interest::WRITE));
        assert!(!rw.is_error());
        assert_eq!(rw & !Interest::READ, Interest::WRITE);
        assert_eq!(Interest::READ.with(Interest::WRITE, true), rw);
        assert_eq!(rw.with(Interest::WRITE, false), Interest::READ);
        assert!(!Interest::NONE.contains(Interest::NONE));
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        assert_eq!(Interest::from_bits(0xFF).bits(), 7);
        assert_eq!(format!("{:?}", Interest::from_bits(5)), "READ|ERROR");
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
    }
}
