//! Audio protocol constants
//!
//! Every Huddle voice stream runs at a single fixed format: 48 kHz
//! interleaved stereo PCM, carved into 20 ms frames. The decode pipeline,
//! the Opus encoder, and the datagram transport all size their buffers
//! from the constants here.

use std::time::Duration;

/// Sample rate for voice audio (48kHz, required by Opus)
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels in the raw PCM stream (interleaved stereo)
pub const CHANNELS: usize = 2;

/// Duration of one voice frame in milliseconds
pub const FRAME_DURATION_MS: u64 = 20;

/// Duration of one voice frame
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_DURATION_MS);

/// PCM samples per channel in one frame (48000 Hz * 20 ms)
pub const SAMPLES_PER_FRAME: usize = 960;

/// Interleaved i16 samples in one frame across all channels
pub const SAMPLES_PER_CHUNK: usize = SAMPLES_PER_FRAME * CHANNELS;

/// Bytes of raw s16le PCM in one frame across all channels
pub const BYTES_PER_CHUNK: usize = SAMPLES_PER_CHUNK * 2;

/// Maximum size of one encoded Opus frame in bytes
///
/// Sized for high-bitrate stereo with headroom; Opus at voice bitrates
/// produces far less.
pub const MAX_ENCODED_FRAME_LEN: usize = 1024;
