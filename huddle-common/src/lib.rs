//! Huddle Common Library
//!
//! Shared wire-level types for the Huddle voice system: audio protocol
//! constants, the datagram header, control-signal payloads, and the
//! helpers for reading/writing signals over a stream.

pub mod audio;
pub mod io;
pub mod packet;
pub mod signal;

/// Version string for the Huddle signaling protocol
pub const SIGNAL_PROTOCOL_VERSION: &str = "0.3";

/// Default port for voice signaling connections
pub const DEFAULT_SIGNAL_PORT: u16 = 8450;
