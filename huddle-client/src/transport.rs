//! Datagram transport: seals encoded frames and fires them at the server
//!
//! One transport exists per completed handshake. It owns the voice socket,
//! the sealer, and the per-stream counters; nothing else in the crate can
//! touch any of them. Sending is fire-and-forget: there are no
//! acknowledgements and nothing is ever retransmitted.

use tokio::net::UdpSocket;
use tracing::debug;

use huddle_common::audio::SAMPLES_PER_FRAME;
use huddle_common::packet::{DatagramHeader, HEADER_LEN};

use crate::codec::Frame;
use crate::crypto::{PacketSealer, TransportKey};
use crate::error::TransportError;

/// Per-stream sequence and timestamp counters
///
/// Fresh counters start at zero. Both wrap at their type boundary; receivers
/// are expected to handle the wrap, so no widening is done here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PacketState {
    pub sequence: u16,
    pub timestamp: u32,
}

impl PacketState {
    fn advance(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
    }
}

/// One-way sender for sealed voice datagrams
pub(crate) struct VoiceTransport {
    socket: UdpSocket,
    sealer: PacketSealer,
    routing_id: u32,
    state: PacketState,
    io_errors: u64,
}

impl VoiceTransport {
    /// Wrap a connected voice socket and the session's key material
    pub fn new(socket: UdpSocket, key: TransportKey, routing_id: u32) -> Self {
        Self {
            socket,
            sealer: PacketSealer::new(key),
            routing_id,
            state: PacketState::default(),
            io_errors: 0,
        }
    }

    /// Seal one encoded frame and send it
    ///
    /// A seal failure is fatal and leaves the counters untouched. Once a
    /// frame is sealed it has consumed its sequence number and media time,
    /// so the counters advance whether or not the socket accepts it; a
    /// socket error is counted and reported, and the next frame may still
    /// be sent.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let header = DatagramHeader {
            sequence: self.state.sequence,
            timestamp: self.state.timestamp,
            routing_id: self.routing_id,
        };
        let header_bytes = header.to_bytes();
        let sealed = self.sealer.seal(&header_bytes, &frame.data)?;

        let mut datagram = Vec::with_capacity(HEADER_LEN + sealed.len());
        datagram.extend_from_slice(&header_bytes);
        datagram.extend_from_slice(&sealed);

        self.state.advance();

        match self.socket.send(&datagram).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.io_errors += 1;
                debug!(
                    error = %err,
                    sequence = header.sequence,
                    "voice datagram send failed"
                );
                Err(TransportError::Io(err))
            }
        }
    }

    /// Socket-level send failures observed so far
    pub fn io_error_count(&self) -> u64 {
        self.io_errors
    }
}

impl std::fmt::Debug for VoiceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceTransport")
            .field("routing_id", &self.routing_id)
            .field("mode", &self.sealer.mode())
            .field("state", &self.state)
            .field("io_errors", &self.io_errors)
            .finish_non_exhaustive()
    }
}
