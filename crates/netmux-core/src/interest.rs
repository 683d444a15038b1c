//! Readiness interest flags

use core::fmt;

/// Which readiness events a socket wants from its multiplexer
///
/// Listening sockets only ever register `READ`; stream sockets toggle
/// write interest on and off as their output queue fills and drains.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    /// Check if read interest is set
    #[inline]
    pub const fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Check if write interest is set
    #[inline]
    pub const fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Combine two interest sets
    #[inline]
    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Interest with write added or removed
    #[inline]
    pub const fn with_write(self, enabled: bool) -> Interest {
        if enabled {
            Interest(self.0 | Self::WRITE.0)
        } else {
            Interest(self.0 & !Self::WRITE.0)
        }
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.readable(), self.writable()) {
            (true, true) => f.write_str("Interest(read|write)"),
            (true, false) => f.write_str("Interest(read)"),
            (false, true) => f.write_str("Interest(write)"),
            (false, false) => f.write_str("Interest(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_flags() {
        assert!(Interest::READ.readable());
        assert!(!Interest::READ.writable());
        assert!(Interest::BOTH.readable());
        assert!(Interest::BOTH.writable());
    }

    #[test]
    fn test_with_write() {
        let i = Interest::READ.with_write(true);
        assert_eq!(i, Interest::BOTH);
        assert_eq!(i.with_write(false), Interest::READ);
    }

    #[test]
    fn test_union() {
        assert_eq!(Interest::READ.union(Interest::WRITE), Interest::BOTH);
    }
}
