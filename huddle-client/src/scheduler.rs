//! Playback scheduler: pull, encode and send one frame every 20 ms
//!
//! Pacing uses absolute deadlines (`epoch + tick * frame duration`) so sleep
//! jitter can never accumulate into drift. A late tick sends immediately and
//! only skips the sleep, never a frame; past the catch-up window the epoch is
//! re-anchored and the discontinuity logged.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::warn;

use huddle_common::audio::FRAME_DURATION;

use crate::codec::FrameEncoder;
use crate::error::{PlaybackError, TransportError};
use crate::source::AudioSource;
use crate::transport::VoiceTransport;

/// Furthest the loop may run behind schedule before re-anchoring
pub(crate) const MAX_CATCHUP: Duration = Duration::from_millis(500);

/// How a playback run ended
#[derive(Debug)]
pub(crate) enum PlaybackOutcome {
    /// The source ran out of audio
    Finished { frames: u64 },
    /// Cancelled by stop or close
    Stopped { frames: u64 },
    Failed(PlaybackError),
}

/// Final report of a playback task, handing the transport back
#[derive(Debug)]
pub(crate) struct PlaybackDone {
    pub outcome: PlaybackOutcome,
    pub transport: VoiceTransport,
}

/// Drive one source to completion or cancellation
///
/// Owns the transport for the duration of the run and returns it in the
/// report. The source is closed before this returns, on every exit path.
pub(crate) async fn run(
    mut transport: VoiceTransport,
    mut source: Box<dyn AudioSource>,
    mut encoder: FrameEncoder,
    mut cancel: oneshot::Receiver<()>,
) -> PlaybackDone {
    let outcome = run_loop(&mut transport, source.as_mut(), &mut encoder, &mut cancel).await;
    source.close().await;
    PlaybackDone { outcome, transport }
}

async fn run_loop(
    transport: &mut VoiceTransport,
    source: &mut dyn AudioSource,
    encoder: &mut FrameEncoder,
    mut cancel: &mut oneshot::Receiver<()>,
) -> PlaybackOutcome {
    let mut epoch = Instant::now();
    let mut tick: u32 = 0;

    loop {
        // cancellation wins over a ready chunk
        let chunk = tokio::select! {
            biased;
            _ = &mut cancel => {
                return PlaybackOutcome::Stopped { frames: encoder.frames_encoded() };
            }
            chunk = source.next_chunk() => chunk,
        };

        let samples = match chunk {
            Ok(Some(samples)) => samples,
            Ok(None) => {
                return PlaybackOutcome::Finished { frames: encoder.frames_encoded() };
            }
            Err(err) => return PlaybackOutcome::Failed(PlaybackError::Source(err)),
        };

        let frame = match encoder.encode(&samples) {
            Ok(frame) => frame,
            Err(err) => return PlaybackOutcome::Failed(PlaybackError::Codec(err)),
        };

        match transport.send_frame(frame).await {
            Ok(()) => {}
            // transient, already counted by the transport
            Err(TransportError::Io(_)) => {}
            Err(err) => return PlaybackOutcome::Failed(PlaybackError::Transport(err)),
        }
        tick += 1;

        let deadline = epoch + FRAME_DURATION * tick;
        let now = Instant::now();
        if now < deadline {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    return PlaybackOutcome::Stopped { frames: encoder.frames_encoded() };
                }
                () = sleep_until(deadline) => {}
            }
        } else {
            let behind = now - deadline;
            if behind > MAX_CATCHUP {
                warn!(
                    behind_ms = behind.as_millis() as u64,
                    tick, "playback fell too far behind, re-anchoring schedule"
                );
                epoch = now - FRAME_DURATION * tick;
            } else {
                warn!(
                    behind_ms = behind.as_millis() as u64,
                    tick, "playback tick late"
                );
            }
        }
    }
}
