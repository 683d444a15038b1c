//! Error types for the socket multiplexer

use core::fmt;

/// Result type for multiplexer operations
pub type MuxResult<T> = Result<T, MuxError>;

/// Errors that can occur in multiplexer operations
///
/// Per-connection conditions (a failed accept, a malformed peer address)
/// are isolated to the offending socket and never escape `poll`.
/// `Poll(errno)` is the only instance-fatal variant: the readiness-wait
/// primitive itself failed and the multiplexer should be recreated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Malformed textual endpoint ("host:port")
    AddressParse,

    /// Transient accept failure (carries the OS errno)
    Accept(i32),

    /// Socket is already registered with a multiplexer
    AlreadyRegistered,

    /// Socket is not registered (or its registration already ended)
    NotRegistered,

    /// Socket belongs to a different multiplexer
    ForeignSocket,

    /// Registry slot cap reached
    RegistryFull,

    /// A `poll` is already in flight on this instance
    PollBusy,

    /// The readiness-wait primitive failed (carries the OS errno).
    /// Fatal to this multiplexer instance.
    Poll(i32),

    /// Socket setup syscall failed (socket/bind/listen/connect/...)
    Platform(i32),
}

impl MuxError {
    /// Check if this error is fatal to the whole multiplexer instance
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, MuxError::Poll(_))
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::AddressParse => write!(f, "malformed socket address"),
            MuxError::Accept(errno) => write!(f, "accept failed: errno {}", errno),
            MuxError::AlreadyRegistered => write!(f, "socket already registered"),
            MuxError::NotRegistered => write!(f, "socket not registered"),
            MuxError::ForeignSocket => write!(f, "socket belongs to another multiplexer"),
            MuxError::RegistryFull => write!(f, "registry slot cap reached"),
            MuxError::PollBusy => write!(f, "poll already in flight on this multiplexer"),
            MuxError::Poll(errno) => write!(f, "readiness wait failed: errno {}", errno),
            MuxError::Platform(errno) => write!(f, "platform error: errno {}", errno),
        }
    }
}

impl std::error::Error for MuxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", MuxError::AddressParse),
            "malformed socket address"
        );
        assert_eq!(format!("{}", MuxError::Poll(9)), "readiness wait failed: errno 9");
    }

    #[test]
    fn test_fatality() {
        assert!(MuxError::Poll(22).is_fatal());
        assert!(!MuxError::Accept(11).is_fatal());
        assert!(!MuxError::AlreadyRegistered.is_fatal());
    }

    #[test]
    fn test_error_trait_object() {
        let err: Box<dyn std::error::Error> = Box::new(MuxError::RegistryFull);
        assert_eq!(err.to_string(), "registry slot cap reached");
    }
}
