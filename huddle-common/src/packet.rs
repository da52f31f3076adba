//! Voice datagram header
//!
//! Every voice datagram starts with a fixed 11-byte header followed by the
//! AEAD-sealed frame payload and its authentication tag. The header is sent
//! in the clear; the sealer derives its per-packet nonce from these same
//! bytes, so the sequence/timestamp fields double as nonce material.

/// Version/flags byte for the current datagram layout
pub const DATAGRAM_VERSION: u8 = 0x80;

/// Size of the datagram header in bytes
pub const HEADER_LEN: usize = 11;

/// Size of the AEAD authentication tag appended to the payload
pub const TAG_LEN: usize = 16;

/// Header of one voice datagram
///
/// Wire format (big-endian):
/// ```text
/// +---------+----------+-----------+------------+------------------+
/// | version | sequence | timestamp | routing id | sealed payload   |
/// | 1 byte  | 2 bytes  | 4 bytes   | 4 bytes    | variable + tag   |
/// +---------+----------+-----------+------------+------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Packet sequence number; wraps at u16::MAX
    pub sequence: u16,
    /// Sample-clock timestamp; advances by samples-per-frame, wraps at u32::MAX
    pub timestamp: u32,
    /// Server-assigned stream identifier
    pub routing_id: u32,
}

impl DatagramHeader {
    /// Serialize the header to its wire representation
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = DATAGRAM_VERSION;
        bytes[1..3].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[3..7].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[7..11].copy_from_slice(&self.routing_id.to_be_bytes());
        bytes
    }

    /// Parse a datagram into its header and sealed payload
    ///
    /// Returns `None` if the datagram is too short or carries an unknown
    /// version byte.
    #[must_use]
    pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        if datagram[0] != DATAGRAM_VERSION {
            return None;
        }

        let sequence = u16::from_be_bytes([datagram[1], datagram[2]]);
        let timestamp = u32::from_be_bytes([datagram[3], datagram[4], datagram[5], datagram[6]]);
        let routing_id = u32::from_be_bytes([datagram[7], datagram[8], datagram[9], datagram[10]]);

        Some((
            Self {
                sequence,
                timestamp,
                routing_id,
            },
            &datagram[HEADER_LEN..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = DatagramHeader {
            sequence: 0x0102,
            timestamp: 0x03040506,
            routing_id: 0x0708090A,
        };
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], DATAGRAM_VERSION);
        // Big-endian field placement
        assert_eq!(&bytes[1..3], &[0x01, 0x02]);
        assert_eq!(&bytes[3..7], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[7..11], &[0x07, 0x08, 0x09, 0x0A]);
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let header = DatagramHeader {
            sequence: 65535,
            timestamp: u32::MAX - 1,
            routing_id: 42,
        };

        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(b"sealed audio bytes");

        let (parsed, payload) = DatagramHeader::parse(&datagram).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"sealed audio bytes");
    }

    #[test]
    fn test_parse_empty_payload() {
        let header = DatagramHeader {
            sequence: 0,
            timestamp: 0,
            routing_id: 0,
        };
        let bytes = header.to_bytes();
        let (parsed, payload) = DatagramHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_too_short() {
        assert!(DatagramHeader::parse(&[]).is_none());
        assert!(DatagramHeader::parse(&[DATAGRAM_VERSION; HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_parse_unknown_version() {
        let header = DatagramHeader {
            sequence: 1,
            timestamp: 2,
            routing_id: 3,
        };
        let mut bytes = header.to_bytes();
        bytes[0] = 0x00;
        assert!(DatagramHeader::parse(&bytes).is_none());
    }
}
