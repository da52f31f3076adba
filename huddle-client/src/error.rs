//! Error types for the voice client
//!
//! Each layer owns its failure vocabulary: the handshake, the datagram
//! transport, audio sources, and the codec. `PlayError` is what the
//! connection facade's `play` can return, and `PlaybackError` is what a
//! running playback can end with.

use std::fmt;
use std::io;

// =============================================================================
// Handshake
// =============================================================================

/// Why a session handshake failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The server refused the identify payload
    AuthRejected(String),
    /// The control channel disconnected, a step timed out, or address
    /// discovery got no answer
    Timeout,
    /// The two sides share no encryption mode, or the server sent a
    /// malformed session setup
    ProtocolMismatch,
    /// A new route replaced this attempt before it finished
    Superseded,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::AuthRejected(reason) if reason.is_empty() => {
                write!(f, "authentication rejected")
            }
            HandshakeError::AuthRejected(reason) => {
                write!(f, "authentication rejected: {reason}")
            }
            HandshakeError::Timeout => write!(f, "handshake timed out"),
            HandshakeError::ProtocolMismatch => write!(f, "protocol mismatch"),
            HandshakeError::Superseded => write!(f, "handshake superseded by a new route"),
        }
    }
}

impl std::error::Error for HandshakeError {}

// =============================================================================
// Transport
// =============================================================================

/// Why a datagram send failed
#[derive(Debug)]
pub enum TransportError {
    /// No handshake has completed; there is nothing to send on
    NotReady,
    /// Sealing a payload failed; key material is presumed corrupt
    EncryptionFailure,
    /// The socket refused the datagram; the packet is lost, the
    /// transport is still usable
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotReady => write!(f, "transport not ready"),
            TransportError::EncryptionFailure => write!(f, "encryption failed"),
            TransportError::Io(err) => write!(f, "datagram send failed: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Why an audio source could not be opened or read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The descriptor does not name a readable file
    NotFound(String),
    /// The decode pipeline could not produce audio from this input
    UnsupportedFormat(String),
    /// The decode pipeline reported an error mid-stream
    DecodeFailure(String),
    /// The decode pipeline exited without finishing the stream
    ProcessCrashed(String),
    /// The decode pipeline produced nothing within the stall timeout
    Stalled,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NotFound(path) => write!(f, "source not found: {path}"),
            SourceError::UnsupportedFormat(detail) => {
                write!(f, "unsupported source format: {detail}")
            }
            SourceError::DecodeFailure(detail) => write!(f, "decode failure: {detail}"),
            SourceError::ProcessCrashed(detail) => {
                write!(f, "decode pipeline crashed: {detail}")
            }
            SourceError::Stalled => write!(f, "decode pipeline stalled"),
        }
    }
}

impl std::error::Error for SourceError {}

// =============================================================================
// Codec
// =============================================================================

/// Why encoding a PCM chunk failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The chunk does not hold exactly one frame of samples
    InvalidInput { expected: usize, actual: usize },
    /// The Opus encoder failed internally
    Opus(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidInput { expected, actual } => {
                write!(f, "invalid input: expected {expected} samples, got {actual}")
            }
            CodecError::Opus(detail) => write!(f, "opus error: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

// =============================================================================
// Facade
// =============================================================================

/// Why `play` was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayError {
    /// No handshake has completed on this connection
    NotReady,
    /// A source is already playing; stop it first
    AlreadyPlaying,
    /// The connection has been closed
    Closed,
    /// The encoder for the new source could not be created
    Codec(CodecError),
    /// The source could not be opened
    Source(SourceError),
}

impl fmt::Display for PlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayError::NotReady => write!(f, "connection not ready"),
            PlayError::AlreadyPlaying => write!(f, "a source is already playing"),
            PlayError::Closed => write!(f, "connection closed"),
            PlayError::Codec(err) => write!(f, "{err}"),
            PlayError::Source(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PlayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlayError::Codec(err) => Some(err),
            PlayError::Source(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SourceError> for PlayError {
    fn from(err: SourceError) -> Self {
        PlayError::Source(err)
    }
}

impl From<CodecError> for PlayError {
    fn from(err: CodecError) -> Self {
        PlayError::Codec(err)
    }
}

/// Why a running playback ended early
#[derive(Debug)]
pub enum PlaybackError {
    /// The source failed mid-stream
    Source(SourceError),
    /// Encoding failed mid-stream
    Codec(CodecError),
    /// The transport failed fatally
    Transport(TransportError),
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::Source(err) => write!(f, "{err}"),
            PlaybackError::Codec(err) => write!(f, "{err}"),
            PlaybackError::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PlaybackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlaybackError::Source(err) => Some(err),
            PlaybackError::Codec(err) => Some(err),
            PlaybackError::Transport(err) => Some(err),
        }
    }
}
