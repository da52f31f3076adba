//! Audio sources: anything that can yield 20 ms chunks of interleaved PCM
//!
//! The main implementation shells out to ffmpeg and streams raw PCM from its
//! stdout. A dedicated reader task drains the pipe into a small bounded
//! queue, so the decoder may run slightly ahead of the 20 ms cadence without
//! buffering a whole file in memory.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use huddle_common::audio::{BYTES_PER_CHUNK, FRAME_DURATION, SAMPLES_PER_CHUNK};

use crate::error::SourceError;

/// Decoded chunks that may queue between the reader task and the caller
const CHUNK_BUFFER_FRAMES: usize = 8;

/// Longest wait for a pipeline to produce the next chunk
pub const STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest wait for first audio when opening a file
const OPEN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Decoder program looked up on PATH
const DECODER_PROGRAM: &str = "ffmpeg";

/// A pull-based stream of fixed-size PCM chunks
///
/// Every successful chunk holds exactly [`SAMPLES_PER_CHUNK`] interleaved
/// samples; a short tail is padded with silence by the implementation.
#[async_trait]
pub trait AudioSource: Send {
    /// Pull the next 20 ms of audio, or `Ok(None)` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>, SourceError>;

    /// Release everything the source holds
    ///
    /// When this returns, any subprocess is terminated and reaped and any
    /// buffers are dropped. Idempotent.
    async fn close(&mut self);
}

// =============================================================================
// Silence
// =============================================================================

/// A fixed run of silent frames
#[derive(Debug, Clone)]
pub struct SilenceSource {
    remaining: u64,
}

impl SilenceSource {
    /// Silence covering `duration`, rounded up to whole frames
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        let frames = duration.as_micros().div_ceil(FRAME_DURATION.as_micros());
        Self {
            remaining: frames as u64,
        }
    }

    /// Exactly `frames` frames of silence
    #[must_use]
    pub fn frames(frames: u64) -> Self {
        Self { remaining: frames }
    }
}

#[async_trait]
impl AudioSource for SilenceSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>, SourceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(vec![0i16; SAMPLES_PER_CHUNK]))
    }

    async fn close(&mut self) {
        self.remaining = 0;
    }
}

// =============================================================================
// Decoder Pipeline
// =============================================================================

/// PCM streamed from a decoder subprocess's stdout
///
/// Dropping without [`AudioSource::close`] still kills the child
/// (`kill_on_drop`), but only `close` guarantees it has been reaped.
pub struct PipelineSource {
    child: Child,
    chunks: mpsc::Receiver<Result<Vec<i16>, SourceError>>,
    reader: JoinHandle<()>,
    primed: Option<Vec<i16>>,
    closed: bool,
}

impl PipelineSource {
    /// Spawn `program` with `args` and stream PCM chunks from its stdout
    pub fn spawn<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Self, SourceError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::DecodeFailure(format!("{program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::DecodeFailure("decoder stdout unavailable".to_string()))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER_FRAMES);
        let reader = tokio::spawn(read_chunks(stdout, chunk_tx));

        Ok(Self {
            child,
            chunks: chunk_rx,
            reader,
            primed: None,
            closed: false,
        })
    }

    /// Decode an audio file via ffmpeg into session-rate PCM
    ///
    /// Missing and undecodable files are reported here, before the source is
    /// handed to a player.
    pub async fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(SourceError::NotFound(display)),
        }

        let args: Vec<&OsStr> = vec![
            OsStr::new("-i"),
            path.as_os_str(),
            OsStr::new("-f"),
            OsStr::new("s16le"),
            OsStr::new("-ar"),
            OsStr::new("48000"),
            OsStr::new("-ac"),
            OsStr::new("2"),
            OsStr::new("pipe:1"),
        ];
        let mut source = Self::spawn(DECODER_PROGRAM, &args)?;

        if let Err(err) = source.prime(&display).await {
            source.close().await;
            return Err(err);
        }
        Ok(source)
    }

    /// Hold back the first chunk so undecodable input fails the open call
    async fn prime(&mut self, label: &str) -> Result<(), SourceError> {
        match timeout(OPEN_PROBE_TIMEOUT, self.chunks.recv()).await {
            Ok(Some(Ok(chunk))) => {
                self.primed = Some(chunk);
                Ok(())
            }
            Ok(Some(Err(err))) => Err(err),
            // decoder exited without producing a single chunk
            Ok(None) => Err(SourceError::UnsupportedFormat(label.to_string())),
            Err(_) => {
                debug!(source = label, "decoder slow to start, proceeding");
                Ok(())
            }
        }
    }

    /// Pipe closed cleanly: decide end-of-stream vs crash from the exit status
    async fn finish(&mut self) -> Result<Option<Vec<i16>>, SourceError> {
        match timeout(STALL_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(None),
            Ok(Ok(status)) => Err(SourceError::ProcessCrashed(status.to_string())),
            Ok(Err(err)) => Err(SourceError::ProcessCrashed(err.to_string())),
            Err(_) => Err(SourceError::Stalled),
        }
    }
}

#[async_trait]
impl AudioSource for PipelineSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>, SourceError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(chunk) = self.primed.take() {
            return Ok(Some(chunk));
        }

        match timeout(STALL_TIMEOUT, self.chunks.recv()).await {
            Err(_) => Err(SourceError::Stalled),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => self.finish().await,
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.chunks.close();
        self.reader.abort();
        // may already have exited
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        while self.chunks.try_recv().is_ok() {}
        self.primed = None;
    }
}

impl std::fmt::Debug for PipelineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSource")
            .field("pid", &self.child.id())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Drain a decoder pipe into whole chunks, zero-padding the final one
async fn read_chunks(mut stdout: ChildStdout, chunks: mpsc::Sender<Result<Vec<i16>, SourceError>>) {
    loop {
        let mut buf = vec![0u8; BYTES_PER_CHUNK];
        let mut filled = 0;
        let mut eof = false;

        while filled < BYTES_PER_CHUNK {
            match stdout.read(&mut buf[filled..]).await {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(err) => {
                    let _ = chunks
                        .send(Err(SourceError::DecodeFailure(err.to_string())))
                        .await;
                    return;
                }
            }
        }

        // eof on a chunk boundary
        if filled == 0 {
            return;
        }

        // bytes past `filled` are still zero, so a short tail comes out
        // silence-padded
        let samples: Vec<i16> = buf
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if chunks.send(Ok(samples)).await.is_err() {
            return;
        }
        if eof {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NO_ARGS: &[&str] = &[];

    #[tokio::test]
    async fn test_silence_covers_duration_in_whole_frames() {
        let mut source = SilenceSource::new(Duration::from_millis(60));
        for _ in 0..3 {
            let chunk = source.next_chunk().await.unwrap().unwrap();
            assert_eq!(chunk.len(), SAMPLES_PER_CHUNK);
            assert!(chunk.iter().all(|&s| s == 0));
        }
        assert_eq!(source.next_chunk().await.unwrap(), None);

        // partial frames round up
        let mut source = SilenceSource::new(Duration::from_millis(50));
        let mut frames = 0;
        while source.next_chunk().await.unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 3);

        let mut source = SilenceSource::new(Duration::ZERO);
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pipeline_chunks_and_pads_the_tail() {
        // one full chunk plus 50 samples
        let mut pcm = Vec::new();
        for i in 0..(SAMPLES_PER_CHUNK + 50) {
            pcm.extend_from_slice(&((i % 1000) as i16).to_le_bytes());
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pcm).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut source = PipelineSource::spawn("cat", &[path]).unwrap();

        let first = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), SAMPLES_PER_CHUNK);
        assert_eq!(first[0], 0);
        assert_eq!(first[999], 999);
        assert_eq!(first[1000], 0);

        let second = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), SAMPLES_PER_CHUNK);
        assert_eq!(second[0], (SAMPLES_PER_CHUNK % 1000) as i16);
        assert!(second[50..].iter().all(|&s| s == 0));

        assert_eq!(source.next_chunk().await.unwrap(), None);
        source.close().await;
    }

    #[tokio::test]
    async fn test_pipeline_exact_multiple_has_no_padding_chunk() {
        let pcm = vec![1u8; BYTES_PER_CHUNK];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pcm).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut source = PipelineSource::spawn("cat", &[path]).unwrap();
        assert!(source.next_chunk().await.unwrap().is_some());
        assert_eq!(source.next_chunk().await.unwrap(), None);
        source.close().await;
    }

    #[tokio::test]
    async fn test_crash_mid_stream_surfaces_as_process_crashed() {
        let script = format!("head -c {BYTES_PER_CHUNK} /dev/zero; kill -9 $$");
        let mut source = PipelineSource::spawn("sh", &["-c", &script]).unwrap();

        assert!(source.next_chunk().await.unwrap().is_some());
        match source.next_chunk().await {
            Err(SourceError::ProcessCrashed(_)) => {}
            other => panic!("expected ProcessCrashed, got {other:?}"),
        }
        source.close().await;
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        match PipelineSource::open_file("/no/such/file.mp3").await {
            Err(SourceError::NotFound(path)) => assert_eq!(path, "/no/such/file.mp3"),
            other => panic!("expected NotFound, got {other:?}"),
        }

        // directories are not playable either
        match PipelineSource::open_file("/tmp").await {
            Err(SourceError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prime_flags_decoder_with_no_output() {
        let mut source = PipelineSource::spawn("true", NO_ARGS).unwrap();
        match source.prime("junk.mp3").await {
            Err(SourceError::UnsupportedFormat(label)) => assert_eq!(label, "junk.mp3"),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
        source.close().await;
    }

    #[tokio::test]
    async fn test_silent_pipeline_reports_stall() {
        let mut source = PipelineSource::spawn("sleep", &["5"]).unwrap();
        assert_eq!(source.next_chunk().await, Err(SourceError::Stalled));
        source.close().await;
    }

    #[tokio::test]
    async fn test_close_terminates_and_is_idempotent() {
        let mut source = PipelineSource::spawn("sleep", &["30"]).unwrap();
        source.close().await;
        assert!(source.child.id().is_none());

        source.close().await;
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }
}
