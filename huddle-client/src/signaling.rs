//! Control-channel abstraction
//!
//! The handshake and session keepalive run over a signaling connection the
//! caller supplies: any transport that can carry [`SignalMessage`] envelopes
//! both ways. The default is newline-delimited JSON over TCP; embedders with
//! their own control plane implement [`SignalConnector`] instead.

use async_trait::async_trait;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use huddle_common::io::{read_signal, write_signal};
use huddle_common::signal::SignalMessage;

/// Maximum time to wait when dialing a signaling endpoint
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Traits
// =============================================================================

/// A live signaling connection
#[async_trait]
pub trait SignalChannel: Send {
    /// Send one signal to the server
    async fn send(&mut self, message: SignalMessage) -> io::Result<()>;

    /// Receive the next signal
    ///
    /// Returns `Ok(None)` if the connection was cleanly closed.
    async fn recv(&mut self) -> io::Result<Option<SignalMessage>>;

    /// Shut the connection down
    async fn close(&mut self) -> io::Result<()>;
}

/// Dials signaling connections for a connection's handshake attempts
#[async_trait]
pub trait SignalConnector: Send + Sync {
    /// Open a signaling connection to `endpoint` (`host:port`)
    async fn connect(&self, endpoint: &str) -> io::Result<Box<dyn SignalChannel>>;
}

// =============================================================================
// Stream-backed Channel
// =============================================================================

/// [`SignalChannel`] over any split async stream
///
/// Works for TCP halves and for in-memory duplex pipes in tests.
pub struct StreamSignalChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> StreamSignalChannel<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    /// Wrap a read/write half pair
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

#[async_trait]
impl<R, W> SignalChannel for StreamSignalChannel<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, message: SignalMessage) -> io::Result<()> {
        write_signal(&mut self.writer, &message).await
    }

    async fn recv(&mut self) -> io::Result<Option<SignalMessage>> {
        read_signal(&mut self.reader).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

// =============================================================================
// TCP Connector
// =============================================================================

/// Default connector: plain TCP to `host:port`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSignalConnector;

#[async_trait]
impl SignalConnector for TcpSignalConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<Box<dyn SignalChannel>> {
        let stream = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(endpoint),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "signal connect timed out",
                ));
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Box::new(StreamSignalChannel::new(read_half, write_half)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::signal::{Heartbeat, op};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_duplex_channel_roundtrip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let mut client = StreamSignalChannel::new(client_read, client_write);
        let mut server = StreamSignalChannel::new(server_read, server_write);

        let message = SignalMessage::encode(op::HEARTBEAT, &Heartbeat { nonce: 11 }).unwrap();
        client.send(message.clone()).await.unwrap();

        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_tcp_connector_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut channel = StreamSignalChannel::new(read_half, write_half);

            let received = channel.recv().await.unwrap().unwrap();
            channel.send(received).await.unwrap();
        });

        let mut channel = TcpSignalConnector.connect(&addr.to_string()).await.unwrap();
        let message = SignalMessage::encode(op::HEARTBEAT, &Heartbeat { nonce: 3 }).unwrap();
        channel.send(message.clone()).await.unwrap();

        let echoed = channel.recv().await.unwrap().unwrap();
        assert_eq!(echoed, message);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_after_server_close_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut channel = TcpSignalConnector.connect(&addr.to_string()).await.unwrap();
        assert!(channel.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is never listening
        let result = TcpSignalConnector.connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
