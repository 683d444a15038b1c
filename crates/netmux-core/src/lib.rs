//! # netmux-core
//!
//! Core types for the netmux socket event multiplexer.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The multiplexer engine and the platform readiness backends live in
//! the `netmux` crate.
//!
//! ## Modules
//!
//! - `address` - Immutable socket address value type
//! - `key` - Generation-checked registry key
//! - `state` - Socket lifecycle state enum
//! - `interest` - Readiness interest flags
//! - `error` - Error types
//! - `mlog` - Leveled stderr logging macros

pub mod address;
pub mod error;
pub mod interest;
pub mod key;
pub mod mlog;
pub mod state;

// Re-exports for convenience
pub use address::{AddressFamily, SocketAddress};
pub use error::{MuxError, MuxResult};
pub use interest::Interest;
pub use key::SocketKey;
pub use mlog::LogLevel;
pub use state::SocketState;
