//! Generation-checked registry key

use core::fmt;

/// Handle to a slot in a multiplexer registry.
///
/// A key pairs a 32-bit slot index with a 32-bit generation counter.
/// The generation is bumped every time a slot is freed, so a key held
/// past its socket's removal no longer resolves: a mismatched generation
/// is detected instead of dispatching into a destroyed object.
///
/// Keys pack into a `u64` token (`generation << 32 | index`) for the
/// platform readiness backend. `u64::MAX` is reserved as the "no key"
/// sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    index: u32,
    generation: u32,
}

impl SocketKey {
    /// Sentinel token for "not registered"
    pub const NONE_TOKEN: u64 = u64::MAX;

    /// Create a key from slot index and generation
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        SocketKey { index, generation }
    }

    /// Slot index into the registry arena
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot index as usize, for indexing
    #[inline]
    pub const fn index_usize(self) -> usize {
        self.index as usize
    }

    /// Generation the slot had when this key was issued
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the backend token form
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack a backend token. Returns `None` for the sentinel.
    #[inline]
    pub const fn from_token(token: u64) -> Option<Self> {
        if token == Self::NONE_TOKEN {
            None
        } else {
            Some(SocketKey {
                index: token as u32,
                generation: (token >> 32) as u32,
            })
        }
    }
}

impl fmt::Debug for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketKey({}g{})", self.index, self.generation)
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g{}", self.index, self.generation)
    }
}
