//! Opus frame encoding
//!
//! Raw PCM chunks become fixed-duration encoded frames here. One encoder
//! instance serves one audio source: Opus carries prediction state between
//! consecutive frames, so the scheduler creates a fresh `FrameEncoder` per
//! source and never reuses one across sources.

use opus::{Application, Channels, Encoder};

use huddle_common::audio::{MAX_ENCODED_FRAME_LEN, SAMPLE_RATE, SAMPLES_PER_CHUNK};

use crate::error::CodecError;

// =============================================================================
// Frame
// =============================================================================

/// One 20 ms block of encoded audio, ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of this frame within its source, starting at zero
    pub index: u64,
    /// Encoded Opus payload
    pub data: Vec<u8>,
}

// =============================================================================
// Encoder
// =============================================================================

/// Encodes interleaved stereo PCM into voice frames
pub struct FrameEncoder {
    encoder: Encoder,
    next_index: u64,
}

impl FrameEncoder {
    /// Create an encoder for one source's stream
    pub fn new() -> Result<Self, CodecError> {
        let encoder = Encoder::new(SAMPLE_RATE, Channels::Stereo, Application::Audio)
            .map_err(|e| CodecError::Opus(e.to_string()))?;
        Ok(Self {
            encoder,
            next_index: 0,
        })
    }

    /// Encode exactly one frame's worth of interleaved samples
    ///
    /// The chunk must hold [`SAMPLES_PER_CHUNK`] samples; the source layer
    /// zero-pads partial final chunks before they get here.
    pub fn encode(&mut self, samples: &[i16]) -> Result<Frame, CodecError> {
        if samples.len() != SAMPLES_PER_CHUNK {
            return Err(CodecError::InvalidInput {
                expected: SAMPLES_PER_CHUNK,
                actual: samples.len(),
            });
        }

        let mut data = vec![0u8; MAX_ENCODED_FRAME_LEN];
        let len = self
            .encoder
            .encode(samples, &mut data)
            .map_err(|e| CodecError::Opus(e.to_string()))?;
        data.truncate(len);

        let index = self.next_index;
        self.next_index += 1;
        Ok(Frame { index, data })
    }

    /// Frames encoded so far by this instance
    #[must_use]
    pub fn frames_encoded(&self) -> u64 {
        self.next_index
    }
}
