//! Real-time voice streaming client
//!
//! Connects to a huddle voice server over a line-delimited JSON control
//! channel, negotiates an encrypted UDP voice session, and streams Opus
//! frames on a strict 20 ms cadence. Audio comes from pluggable
//! [`source::AudioSource`] implementations; the stock one decodes files
//! through an ffmpeg subprocess.
//!
//! ```no_run
//! use huddle_client::{Connection, ConnectionIdentity, ServerRoute};
//!
//! # async fn demo() {
//! let (connection, mut events) = Connection::new(ConnectionIdentity {
//!     user_id: "7".to_string(),
//!     group_id: "42".to_string(),
//!     session_id: "d3adb33f".to_string(),
//! });
//! connection.set_route(ServerRoute {
//!     endpoint: "voice.example.net:8450".to_string(),
//!     token: "one-time-token".to_string(),
//! });
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod signaling;
pub mod source;

mod codec;
mod crypto;
mod handshake;
mod scheduler;
mod transport;

pub use connection::{Connection, ConnectionEvent};
pub use error::{
    CodecError, HandshakeError, PlayError, PlaybackError, SourceError, TransportError,
};
pub use handshake::{ConnectionIdentity, ServerRoute};
pub use signaling::{SignalChannel, SignalConnector, TcpSignalConnector};
pub use source::{AudioSource, PipelineSource, SilenceSource};
