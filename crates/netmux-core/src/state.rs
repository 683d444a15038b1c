//! Socket lifecycle state

use core::fmt;

/// Lifecycle state of a socket relative to its multiplexer
///
/// `Destroyed` is terminal: a socket object is never re-registered,
/// a new connection gets a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    /// Created, not yet registered with a multiplexer
    Unregistered = 0,

    /// In a multiplexer registry, eligible for dispatch
    Registered = 1,

    /// `close()` called; deregistration pending, no further dispatch
    Closing = 2,

    /// Removal finalized; descriptor released, slot freed
    Destroyed = 3,
}

impl SocketState {
    /// Check if the socket may receive event callbacks
    #[inline]
    pub const fn is_dispatchable(&self) -> bool {
        matches!(self, SocketState::Registered)
    }

    /// Check if the descriptor is still valid
    ///
    /// The fd is owned from registration until `close()` releases it.
    #[inline]
    pub const fn has_descriptor(&self) -> bool {
        matches!(self, SocketState::Registered | SocketState::Closing)
    }

    /// Check if this socket has reached its terminal state
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SocketState::Destroyed)
    }
}

impl From<u8> for SocketState {
    fn from(v: u8) -> Self {
        match v {
            0 => SocketState::Unregistered,
            1 => SocketState::Registered,
            2 => SocketState::Closing,
            _ => SocketState::Destroyed,
        }
    }
}

impl From<SocketState> for u8 {
    fn from(state: SocketState) -> u8 {
        state as u8
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Unregistered => "unregistered",
            SocketState::Registered => "registered",
            SocketState::Closing => "closing",
            SocketState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SocketState::Registered.is_dispatchable());
        assert!(!SocketState::Closing.is_dispatchable());
        assert!(!SocketState::Unregistered.is_dispatchable());

        assert!(SocketState::Registered.has_descriptor());
        assert!(SocketState::Closing.has_descriptor());
        assert!(!SocketState::Destroyed.has_descriptor());

        assert!(SocketState::Destroyed.is_terminal());
        assert!(!SocketState::Closing.is_terminal());
    }

    #[test]
    fn test_state_u8_roundtrip() {
        for state in [
            SocketState::Unregistered,
            SocketState::Registered,
            SocketState::Closing,
            SocketState::Destroyed,
        ] {
            let raw: u8 = state.into();
            assert_eq!(SocketState::from(raw), state);
        }
        // Out-of-range values collapse to the terminal state
        assert_eq!(SocketState::from(200), SocketState::Destroyed);
    }
}
