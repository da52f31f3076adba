//! Transport key material and per-packet sealing
//!
//! The handshake hands the transport a 32-byte symmetric key and a
//! negotiated encryption mode. Every outbound datagram is sealed with an
//! AEAD keyed by that key; the nonce is the 11-byte packet header padded
//! with zeros to the mode's nonce length. Headers never repeat within a
//! key's lifetime (the sequence/timestamp pair is strictly advancing), so
//! nonces never repeat.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce, XChaCha20Poly1305, XNonce, aead::Aead,
};
use std::fmt;

use huddle_common::packet::HEADER_LEN;
use huddle_common::signal::EncryptionMode;

use crate::error::TransportError;

/// Length of a transport key in bytes
pub const KEY_LEN: usize = 32;

// =============================================================================
// Transport Key
// =============================================================================

/// Symmetric key produced by the handshake, consumed by the transport
///
/// The raw bytes are crate-private and the `Debug` impl redacts them; key
/// material never appears in logs or errors.
pub struct TransportKey {
    bytes: [u8; KEY_LEN],
    mode: EncryptionMode,
}

impl TransportKey {
    /// Wrap raw key bytes and the mode they were negotiated for
    #[must_use]
    pub fn new(bytes: [u8; KEY_LEN], mode: EncryptionMode) -> Self {
        Self { bytes, mode }
    }

    /// Build a key from a wire-delivered byte slice
    ///
    /// Returns `None` unless the slice is exactly [`KEY_LEN`] bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8], mode: EncryptionMode) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self { bytes, mode })
    }

    /// The encryption mode this key was negotiated for
    #[must_use]
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportKey")
            .field("mode", &self.mode)
            .field("bytes", &"[redacted]")
            .finish()
    }
}

// =============================================================================
// Packet Sealer
// =============================================================================

enum ModeCipher {
    XChaCha20(Box<XChaCha20Poly1305>),
    ChaCha20(Box<ChaCha20Poly1305>),
}

/// Seals frame payloads under a transport key
///
/// Owns the expanded key state; dropping the sealer releases the key.
pub struct PacketSealer {
    cipher: ModeCipher,
    mode: EncryptionMode,
}

impl PacketSealer {
    /// Expand a transport key into a ready-to-use sealer
    #[must_use]
    pub fn new(key: TransportKey) -> Self {
        let mode = key.mode();
        let cipher = match mode {
            EncryptionMode::XChaCha20Poly1305 => ModeCipher::XChaCha20(Box::new(
                XChaCha20Poly1305::new(Key::from_slice(key.bytes())),
            )),
            EncryptionMode::ChaCha20Poly1305 => ModeCipher::ChaCha20(Box::new(
                ChaCha20Poly1305::new(Key::from_slice(key.bytes())),
            )),
        };
        Self { cipher, mode }
    }

    /// The mode this sealer encrypts with
    #[must_use]
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Seal a frame payload, deriving the nonce from the packet header
    ///
    /// Returns ciphertext with the authentication tag appended.
    pub fn seal(
        &self,
        header: &[u8; HEADER_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        match &self.cipher {
            ModeCipher::XChaCha20(cipher) => {
                let mut nonce = [0u8; 24];
                nonce[..HEADER_LEN].copy_from_slice(header);
                cipher
                    .encrypt(XNonce::from_slice(&nonce), plaintext)
                    .map_err(|_| TransportError::EncryptionFailure)
            }
            ModeCipher::ChaCha20(cipher) => {
                let mut nonce = [0u8; 12];
                nonce[..HEADER_LEN].copy_from_slice(header);
                cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext)
                    .map_err(|_| TransportError::EncryptionFailure)
            }
        }
    }
}

impl fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSealer")
            .field("mode", &self.mode)
            .finish()
    }
}
