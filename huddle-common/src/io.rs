//! I/O utilities for sending and receiving signal messages
//!
//! Signals travel as newline-delimited JSON: one [`SignalMessage`] envelope
//! per line. These helpers are generic over the underlying stream so the
//! same code serves TCP connections and in-memory test pipes.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::signal::SignalMessage;

/// Maximum accepted length of one signal line in bytes
///
/// Signals are small; anything near this limit is a framing error or abuse.
pub const MAX_SIGNAL_LINE: usize = 64 * 1024;

// =============================================================================
// Sending
// =============================================================================

/// Send one signal, newline-terminated, and flush
pub async fn write_signal<W>(writer: &mut W, message: &SignalMessage) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');

    writer.write_all(&bytes).await?;
    writer.flush().await
}

// =============================================================================
// Receiving
// =============================================================================

/// Read one signal from the stream
///
/// Blank lines are skipped. Returns `Ok(None)` if the connection was
/// cleanly closed.
pub async fn read_signal<R>(reader: &mut R) -> io::Result<Option<SignalMessage>>
where
    R: AsyncBufReadExt + Unpin,
{
    loop {
        let mut line = String::new();
        let n = (&mut *reader)
            .take(MAX_SIGNAL_LINE as u64)
            .read_line(&mut line)
            .await?;

        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && n >= MAX_SIGNAL_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signal line too long",
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = serde_json::from_str(trimmed).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid signal: {e}"))
        })?;
        return Ok(Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Heartbeat, op};
    use std::io::Cursor;
    use tokio::io::BufReader;

    fn heartbeat(nonce: u64) -> SignalMessage {
        SignalMessage::encode(op::HEARTBEAT, &Heartbeat { nonce }).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read_signal() {
        let mut buffer = Vec::new();
        write_signal(&mut buffer, &heartbeat(7)).await.unwrap();
        assert!(buffer.ends_with(b"\n"));

        let mut reader = BufReader::new(Cursor::new(buffer));
        let received = read_signal(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.op, op::HEARTBEAT);
        assert_eq!(received.payload::<Heartbeat>().unwrap().nonce, 7);
    }

    #[tokio::test]
    async fn test_read_multiple_signals() {
        let mut buffer = Vec::new();
        write_signal(&mut buffer, &heartbeat(1)).await.unwrap();
        write_signal(&mut buffer, &heartbeat(2)).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(buffer));
        let first = read_signal(&mut reader).await.unwrap().unwrap();
        let second = read_signal(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.payload::<Heartbeat>().unwrap().nonce, 1);
        assert_eq!(second.payload::<Heartbeat>().unwrap().nonce, 2);
        assert!(read_signal(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_signal(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let mut buffer = b"\n\n".to_vec();
        write_signal(&mut buffer, &heartbeat(9)).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(buffer));
        let received = read_signal(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.payload::<Heartbeat>().unwrap().nonce, 9);
    }

    #[tokio::test]
    async fn test_invalid_json_is_error() {
        let mut reader = BufReader::new(Cursor::new(b"{not json}\n".to_vec()));
        let err = read_signal(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_line_is_error() {
        let mut data = vec![b'a'; MAX_SIGNAL_LINE + 16];
        data.push(b'\n');
        let mut reader = BufReader::new(Cursor::new(data));
        let err = read_signal(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_final_line_without_newline() {
        let buffer = serde_json::to_vec(&heartbeat(3)).unwrap();
        let mut reader = BufReader::new(Cursor::new(buffer));
        let received = read_signal(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.payload::<Heartbeat>().unwrap().nonce, 3);
    }
}
