//! Control-channel signal vocabulary
//!
//! Voice sessions are negotiated over a signaling connection that carries
//! small JSON envelopes of the form `{"op": <code>, "d": <payload>}`. This
//! module defines the envelope, the typed payload for each operation, and
//! the encryption-mode list the two sides negotiate from.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default heartbeat interval when the server does not advertise one
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

// =============================================================================
// Operation Codes
// =============================================================================

/// Numeric operation codes for signal envelopes
pub mod op {
    /// Client -> server: authenticate with identity and token
    pub const IDENTIFY: u8 = 0;
    /// Client -> server: submit discovered address and chosen mode
    pub const SELECT_PROTOCOL: u8 = 1;
    /// Server -> client: routing id, voice port, supported modes
    pub const READY: u8 = 2;
    /// Client -> server: keepalive
    pub const HEARTBEAT: u8 = 3;
    /// Server -> client: negotiated mode and transport key
    pub const SESSION_DESCRIPTION: u8 = 4;
    /// Client -> server: speaking indicator
    pub const SPEAKING: u8 = 5;
    /// Server -> client: authentication refused
    pub const REJECTED: u8 = 6;
}

// =============================================================================
// Envelope
// =============================================================================

/// One signal on the control channel
///
/// The payload shape depends on the operation code; use [`SignalMessage::encode`]
/// and [`SignalMessage::payload`] to move between envelopes and typed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Operation code (see [`op`])
    pub op: u8,
    /// Operation payload
    #[serde(default)]
    pub d: serde_json::Value,
}

impl SignalMessage {
    /// Build an envelope from an operation code and a typed payload
    pub fn encode<T: Serialize>(op: u8, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload as the given type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.d.clone())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Identify payload (op 0): authenticates this client for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub group_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

/// Ready payload (op 2): the server's half of session setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    /// Stream identifier assigned to this client
    pub routing_id: u32,
    /// UDP port of the server's voice endpoint
    pub port: u16,
    /// Encryption modes the server supports
    pub modes: Vec<String>,
    /// Keepalive interval for the control channel
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

/// SelectProtocol payload (op 1): the client's discovered address and mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocol {
    /// Transport kind; always `"udp"` for voice
    pub protocol: String,
    pub data: SelectProtocolData,
}

/// Address/mode block inside [`SelectProtocol`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    /// Externally visible IP address, as a string
    pub address: String,
    /// Externally visible UDP port
    pub port: u16,
    /// Chosen encryption mode (one of the server's advertised modes)
    pub mode: String,
}

/// SessionDescription payload (op 4): completes the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Encryption mode the server settled on
    pub mode: String,
    /// Symmetric transport key (32 bytes, serialized as a JSON byte array)
    pub secret_key: Vec<u8>,
}

/// Heartbeat payload (op 3)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch at send time
    pub nonce: u64,
}

/// Speaking payload (op 5): advisory start/stop-of-audio indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: bool,
    /// Latency hint in milliseconds; zero for a sending client
    pub delay: u32,
    pub routing_id: u32,
}

/// Rejected payload (op 6): the server refused the Identify
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    #[serde(default)]
    pub reason: String,
}

// =============================================================================
// Encryption Modes
// =============================================================================

/// AEAD schemes a transport key can be used with
///
/// The list is versioned: entries are ordered strongest-first, and
/// negotiation picks the first entry both sides support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// XChaCha20-Poly1305 with a 24-byte header-derived nonce
    XChaCha20Poly1305,
    /// ChaCha20-Poly1305 with a 12-byte header-derived nonce
    ChaCha20Poly1305,
}

/// Modes this implementation supports, strongest first
pub const SUPPORTED_MODES: [EncryptionMode; 2] = [
    EncryptionMode::XChaCha20Poly1305,
    EncryptionMode::ChaCha20Poly1305,
];

impl EncryptionMode {
    /// Wire name for this mode
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::XChaCha20Poly1305 => "xchacha20_poly1305",
            EncryptionMode::ChaCha20Poly1305 => "chacha20_poly1305",
        }
    }

    /// Parse a wire name; unknown names return `None`
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xchacha20_poly1305" => Some(EncryptionMode::XChaCha20Poly1305),
            "chacha20_poly1305" => Some(EncryptionMode::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Nonce length in bytes for this mode
    #[must_use]
    pub fn nonce_len(&self) -> usize {
        match self {
            EncryptionMode::XChaCha20Poly1305 => 24,
            EncryptionMode::ChaCha20Poly1305 => 12,
        }
    }

    /// Pick the strongest mutually supported mode from a server's list
    #[must_use]
    pub fn negotiate(offered: &[String]) -> Option<Self> {
        SUPPORTED_MODES
            .into_iter()
            .find(|mode| offered.iter().any(|name| name == mode.as_str()))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_wire_shape() {
        let identify = Identify {
            group_id: "2".to_string(),
            user_id: "1".to_string(),
            session_id: "abc".to_string(),
            token: "tok".to_string(),
        };
        let msg = SignalMessage::encode(op::IDENTIFY, &identify).unwrap();
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"op\":0"));
        assert!(json.contains("\"group_id\":\"2\""));
        assert!(json.contains("\"user_id\":\"1\""));
        assert!(json.contains("\"session_id\":\"abc\""));
        assert!(json.contains("\"token\":\"tok\""));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.payload::<Identify>().unwrap(), identify);
    }

    #[test]
    fn test_ready_default_heartbeat_interval() {
        let json = r#"{"op":2,"d":{"routing_id":7,"port":9000,"modes":["chacha20_poly1305"]}}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        let ready: Ready = msg.payload().unwrap();

        assert_eq!(ready.routing_id, 7);
        assert_eq!(ready.port, 9000);
        assert_eq!(ready.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let msg: SignalMessage = serde_json::from_str(r#"{"op":3}"#).unwrap();
        assert_eq!(msg.op, op::HEARTBEAT);
        assert!(msg.d.is_null());
    }

    #[test]
    fn test_secret_key_serializes_as_byte_array() {
        let desc = SessionDescription {
            mode: "xchacha20_poly1305".to_string(),
            secret_key: vec![7u8; 32],
        };
        let msg = SignalMessage::encode(op::SESSION_DESCRIPTION, &desc).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"secret_key\":[7,7,"));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        let back: SessionDescription = parsed.payload().unwrap();
        assert_eq!(back.secret_key.len(), 32);
    }

    #[test]
    fn test_mode_names_roundtrip() {
        for mode in SUPPORTED_MODES {
            assert_eq!(EncryptionMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(EncryptionMode::parse("xsalsa20_poly1305"), None);
    }

    #[test]
    fn test_negotiate_prefers_strongest() {
        let offered = vec![
            "chacha20_poly1305".to_string(),
            "xchacha20_poly1305".to_string(),
        ];
        assert_eq!(
            EncryptionMode::negotiate(&offered),
            Some(EncryptionMode::XChaCha20Poly1305)
        );

        let fallback = vec!["chacha20_poly1305".to_string(), "legacy".to_string()];
        assert_eq!(
            EncryptionMode::negotiate(&fallback),
            Some(EncryptionMode::ChaCha20Poly1305)
        );
    }

    #[test]
    fn test_negotiate_no_common_mode() {
        let offered = vec!["xsalsa20_poly1305".to_string()];
        assert_eq!(EncryptionMode::negotiate(&offered), None);
        assert_eq!(EncryptionMode::negotiate(&[]), None);
    }

    #[test]
    fn test_nonce_lengths() {
        assert_eq!(EncryptionMode::XChaCha20Poly1305.nonce_len(), 24);
        assert_eq!(EncryptionMode::ChaCha20Poly1305.nonce_len(), 12);
    }
}
