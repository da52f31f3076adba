//! Connection facade and the session task behind it
//!
//! `Connection` is a cheap handle. All mutable state lives in one spawned
//! session task that owns the control channel, the transport, and playback;
//! lifecycle calls are messages to that task, so they execute one at a time
//! in arrival order and never race each other.
//!
//! While a source plays, the transport is lent to the playback task and
//! handed back in its final report. Exactly one task can touch the socket
//! and key at any moment, without locks.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};

use huddle_common::signal::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, Heartbeat, SignalMessage, Speaking, op,
};

use crate::codec::FrameEncoder;
use crate::error::{HandshakeError, PlayError, PlaybackError, TransportError};
use crate::handshake::{self, ConnectionIdentity, HandshakeOutcome, ServerRoute};
use crate::scheduler::{self, PlaybackDone, PlaybackOutcome};
use crate::signaling::{SignalChannel, SignalConnector, TcpSignalConnector};
use crate::source::{AudioSource, PipelineSource};
use crate::transport::VoiceTransport;

// =============================================================================
// Public Surface
// =============================================================================

/// Things a connection reports while it runs
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A handshake completed; audio may now be played
    Ready { routing_id: u32 },
    /// A handshake attempt ended without a session
    HandshakeFailed(HandshakeError),
    PlaybackStarted,
    /// The current source ran out of audio (not emitted for `stop`)
    PlaybackFinished,
    PlaybackFailed(PlaybackError),
    /// The connection shut down and will emit nothing further
    Closed,
}

/// Handle to one voice connection
///
/// Created idle; supply a route with [`Connection::set_route`] to start a
/// handshake. Dropping the handle closes the connection.
pub struct Connection {
    command_tx: mpsc::UnboundedSender<Command>,
    is_playing: Arc<AtomicBool>,
}

impl Connection {
    /// Create a connection for `identity`, idle until a route arrives
    pub fn new(
        identity: ConnectionIdentity,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        Self::with_connector(identity, Arc::new(TcpSignalConnector))
    }

    /// Like [`Connection::new`], with a custom signaling connector
    pub fn with_connector(
        identity: ConnectionIdentity,
        connector: Arc<dyn SignalConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let is_playing = Arc::new(AtomicBool::new(false));

        let task = SessionTask::new(identity, connector, command_rx, event_tx, is_playing.clone());
        tokio::spawn(task.run());

        (
            Self {
                command_tx,
                is_playing,
            },
            event_rx,
        )
    }

    /// Point the connection at a voice server, or at a replacement one
    ///
    /// Starts a handshake. A handshake already in flight is superseded; an
    /// established session is left and re-established against the new route.
    pub fn set_route(&self, route: ServerRoute) {
        let _ = self.command_tx.send(Command::SetRoute(route));
    }

    /// Play one source, to completion or until stopped
    ///
    /// Fails fast: [`PlayError::NotReady`] without a completed handshake and
    /// [`PlayError::AlreadyPlaying`] while another source runs.
    pub async fn play(&self, source: Box<dyn AudioSource>) -> Result<(), PlayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Play {
            source,
            reply: reply_tx,
        };
        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(command) {
            if let Command::Play { mut source, .. } = command {
                source.close().await;
            }
            return Err(PlayError::Closed);
        }
        reply_rx.await.map_err(|_| PlayError::Closed)?
    }

    /// Decode an audio file through the standard pipeline and play it
    pub async fn play_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PlayError> {
        let source = PipelineSource::open_file(path).await?;
        self.play(Box::new(source)).await
    }

    /// Stop the current playback, if any
    ///
    /// Returns once the playback task has wound down; a no-op when idle.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Stop { reply: reply_tx })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    /// Shut the connection down: stop playback, leave the session, close
    /// every channel and subprocess
    ///
    /// Safe to call any number of times.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Close {
                reply: Some(reply_tx),
            })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    /// Whether a source is playing right now
    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::Relaxed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Close { reply: None });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_playing", &self.is_playing())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session Task
// =============================================================================

enum Command {
    SetRoute(ServerRoute),
    Play {
        source: Box<dyn AudioSource>,
        reply: oneshot::Sender<Result<(), PlayError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Report from a finished handshake attempt
struct AttemptDone {
    generation: u64,
    result: Result<(HandshakeOutcome, Box<dyn SignalChannel>), HandshakeError>,
}

/// Playback currently owning the transport
struct ActivePlayback {
    cancel: Option<oneshot::Sender<()>>,
    /// Stop callers waiting for the wind-down
    waiters: Vec<oneshot::Sender<()>>,
}

struct SessionTask {
    identity: ConnectionIdentity,
    connector: Arc<dyn SignalConnector>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    is_playing: Arc<AtomicBool>,

    route: Option<ServerRoute>,
    /// Bumped for every attempt; stale completions are discarded by it
    generation: u64,
    /// Whether this route already consumed its single timeout retry
    retried: bool,
    attempt: Option<JoinHandle<()>>,
    attempt_tx: mpsc::UnboundedSender<AttemptDone>,
    attempt_rx: mpsc::UnboundedReceiver<AttemptDone>,

    transport: Option<VoiceTransport>,
    routing_id: Option<u32>,
    signal_out: Option<mpsc::UnboundedSender<SignalMessage>>,
    signal_in: Option<mpsc::UnboundedReceiver<SignalMessage>>,
    pump: Option<JoinHandle<()>>,

    playing: Option<ActivePlayback>,
    playback_tx: mpsc::UnboundedSender<PlaybackDone>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackDone>,

    closed: bool,
}

impl SessionTask {
    fn new(
        identity: ConnectionIdentity,
        connector: Arc<dyn SignalConnector>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        is_playing: Arc<AtomicBool>,
    ) -> Self {
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            connector,
            command_rx,
            event_tx,
            is_playing,
            route: None,
            generation: 0,
            retried: false,
            attempt: None,
            attempt_tx,
            attempt_rx,
            transport: None,
            routing_id: None,
            signal_out: None,
            signal_in: None,
            pump: None,
            playing: None,
            playback_tx,
            playback_rx,
            closed: false,
        }
    }

    async fn run(mut self) {
        let mut heartbeat = interval(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.closed {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // every handle gone
                    None => self.shutdown(None).await,
                },
                Some(done) = self.attempt_rx.recv() => {
                    self.on_attempt_done(done, &mut heartbeat).await;
                }
                Some(done) = self.playback_rx.recv() => self.on_playback_done(done).await,
                message = recv_signal(&mut self.signal_in) => self.on_signal(message).await,
                _ = heartbeat.tick() => self.on_heartbeat(),
            }
        }
        self.drain_commands().await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetRoute(route) => self.on_set_route(route).await,
            Command::Play { source, reply } => {
                let result = self.start_playback(source).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => self.on_stop(reply),
            Command::Close { reply } => self.shutdown(reply).await,
        }
    }

    // -------------------------------------------------------------------
    // Routes and handshakes
    // -------------------------------------------------------------------

    async fn on_set_route(&mut self, route: ServerRoute) {
        if self.attempt.is_some() {
            self.abort_attempt().await;
            self.emit(ConnectionEvent::HandshakeFailed(HandshakeError::Superseded));
        }
        if self.transport.is_some() || self.playing.is_some() || self.pump.is_some() {
            info!("route replaced, leaving the current voice session");
            self.teardown_session().await;
        }

        self.route = Some(route);
        self.retried = false;
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let Some(route) = self.route.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        let identity = self.identity.clone();
        let connector = self.connector.clone();
        let attempt_tx = self.attempt_tx.clone();

        debug!(endpoint = %route.endpoint, generation, "starting handshake attempt");
        self.attempt = Some(tokio::spawn(async move {
            let result = attempt(identity, route, connector).await;
            let _ = attempt_tx.send(AttemptDone { generation, result });
        }));
    }

    async fn abort_attempt(&mut self) {
        if let Some(handle) = self.attempt.take() {
            handle.abort();
            let _ = handle.await;
        }
        // a completion racing the abort must not resurrect the old session
        while let Ok(done) = self.attempt_rx.try_recv() {
            discard_attempt(done);
        }
    }

    async fn on_attempt_done(&mut self, done: AttemptDone, heartbeat: &mut Interval) {
        if done.generation != self.generation {
            discard_attempt(done);
            return;
        }
        self.attempt = None;

        match done.result {
            Ok((outcome, channel)) => self.enter_ready(outcome, channel, heartbeat),
            Err(err) => {
                warn!(error = %err, generation = done.generation, "handshake failed");
                let retry = err == HandshakeError::Timeout && !self.retried;
                self.emit(ConnectionEvent::HandshakeFailed(err));
                if retry {
                    self.retried = true;
                    info!("retrying the handshake once");
                    self.start_attempt();
                }
            }
        }
    }

    fn enter_ready(
        &mut self,
        outcome: HandshakeOutcome,
        channel: Box<dyn SignalChannel>,
        heartbeat: &mut Interval,
    ) {
        info!(
            routing_id = outcome.routing_id,
            external = %outcome.external_addr,
            mode = %outcome.key.mode(),
            "voice session ready"
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.pump = Some(tokio::spawn(pump_signals(channel, out_rx, in_tx)));
        self.signal_out = Some(out_tx);
        self.signal_in = Some(in_rx);

        self.routing_id = Some(outcome.routing_id);
        self.transport = Some(VoiceTransport::new(
            outcome.socket,
            outcome.key,
            outcome.routing_id,
        ));

        *heartbeat = interval_at(
            Instant::now() + outcome.heartbeat_interval,
            outcome.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.retried = false;
        self.emit(ConnectionEvent::Ready {
            routing_id: outcome.routing_id,
        });
    }

    // -------------------------------------------------------------------
    // Control channel
    // -------------------------------------------------------------------

    async fn on_signal(&mut self, message: Option<SignalMessage>) {
        let Some(message) = message else {
            // post-ready loss: heartbeats stop, datagrams keep flowing
            warn!("control channel lost, voice datagrams continue");
            self.drop_control().await;
            return;
        };
        match message.op {
            op::HEARTBEAT => debug!("heartbeat acknowledged"),
            other => debug!(op = other, "ignoring signal"),
        }
    }

    fn on_heartbeat(&mut self) {
        let Some(out) = &self.signal_out else {
            return;
        };
        let payload = Heartbeat {
            nonce: unix_millis(),
        };
        match SignalMessage::encode(op::HEARTBEAT, &payload) {
            Ok(message) => {
                let _ = out.send(message);
            }
            Err(err) => debug!(error = %err, "heartbeat encode failed"),
        }
    }

    fn send_speaking(&mut self, speaking: bool) {
        let (Some(out), Some(routing_id)) = (&self.signal_out, self.routing_id) else {
            return;
        };
        let payload = Speaking {
            speaking,
            delay: 0,
            routing_id,
        };
        if let Ok(message) = SignalMessage::encode(op::SPEAKING, &payload) {
            let _ = out.send(message);
        }
    }

    async fn drop_control(&mut self) {
        self.signal_out = None;
        self.signal_in = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }

    // -------------------------------------------------------------------
    // Playback
    // -------------------------------------------------------------------

    async fn start_playback(&mut self, mut source: Box<dyn AudioSource>) -> Result<(), PlayError> {
        if self.playing.is_some() {
            source.close().await;
            return Err(PlayError::AlreadyPlaying);
        }
        let Some(transport) = self.transport.take() else {
            source.close().await;
            return Err(PlayError::NotReady);
        };

        // a fresh encoder per source keeps codec state from bleeding over
        let encoder = match FrameEncoder::new() {
            Ok(encoder) => encoder,
            Err(err) => {
                self.transport = Some(transport);
                source.close().await;
                return Err(PlayError::Codec(err));
            }
        };

        self.send_speaking(true);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let playback_tx = self.playback_tx.clone();
        tokio::spawn(async move {
            let done = scheduler::run(transport, source, encoder, cancel_rx).await;
            let _ = playback_tx.send(done);
        });

        self.playing = Some(ActivePlayback {
            cancel: Some(cancel_tx),
            waiters: Vec::new(),
        });
        self.is_playing.store(true, Ordering::Relaxed);
        self.emit(ConnectionEvent::PlaybackStarted);
        Ok(())
    }

    fn on_stop(&mut self, reply: oneshot::Sender<()>) {
        match &mut self.playing {
            Some(playback) => {
                if let Some(cancel) = playback.cancel.take() {
                    let _ = cancel.send(());
                }
                playback.waiters.push(reply);
            }
            None => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_playback_done(&mut self, done: PlaybackDone) {
        debug!(
            io_errors = done.transport.io_error_count(),
            "playback returned the transport"
        );
        self.transport = Some(done.transport);

        let waiters = match self.playing.take() {
            Some(playback) => playback.waiters,
            None => Vec::new(),
        };
        self.is_playing.store(false, Ordering::Relaxed);
        self.send_speaking(false);
        for waiter in waiters {
            let _ = waiter.send(());
        }

        match done.outcome {
            PlaybackOutcome::Finished { frames } => {
                debug!(frames, "playback finished");
                self.emit(ConnectionEvent::PlaybackFinished);
            }
            PlaybackOutcome::Stopped { frames } => debug!(frames, "playback stopped"),
            PlaybackOutcome::Failed(err) => {
                warn!(error = %err, "playback failed");
                let fatal = matches!(
                    &err,
                    PlaybackError::Transport(TransportError::EncryptionFailure)
                );
                self.emit(ConnectionEvent::PlaybackFailed(err));
                if fatal {
                    warn!("encryption failure is unrecoverable, closing");
                    self.shutdown(None).await;
                }
            }
        }
    }

    /// Cancel playback and wait for its final report
    async fn stop_playback_and_wait(&mut self, restore_transport: bool) {
        let Some(mut playback) = self.playing.take() else {
            return;
        };
        if let Some(cancel) = playback.cancel.take() {
            let _ = cancel.send(());
        }
        // the playback task acknowledges promptly with its report
        if let Some(done) = self.playback_rx.recv().await {
            debug!(
                io_errors = done.transport.io_error_count(),
                "playback returned the transport"
            );
            if restore_transport {
                self.transport = Some(done.transport);
            }
        }
        self.is_playing.store(false, Ordering::Relaxed);
        self.send_speaking(false);
        for waiter in playback.waiters {
            let _ = waiter.send(());
        }
    }

    // -------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------

    /// Leave the current voice session, keeping the task alive for the next
    /// route
    async fn teardown_session(&mut self) {
        self.stop_playback_and_wait(false).await;
        self.transport = None;
        self.routing_id = None;
        self.signal_out = None;
        self.signal_in = None;
        if let Some(pump) = self.pump.take() {
            // exits on its own once the outbound side is gone
            let _ = pump.await;
        }
    }

    async fn shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if self.closed {
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }
        self.closed = true;
        info!("closing connection");

        self.abort_attempt().await;
        self.teardown_session().await;

        self.emit(ConnectionEvent::Closed);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    /// Fail whatever was queued behind a close
    async fn drain_commands(&mut self) {
        self.command_rx.close();
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::SetRoute(_) => {}
                Command::Play { mut source, reply } => {
                    source.close().await;
                    let _ = reply.send(Err(PlayError::Closed));
                }
                Command::Stop { reply } => {
                    let _ = reply.send(());
                }
                Command::Close { reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn attempt(
    identity: ConnectionIdentity,
    route: ServerRoute,
    connector: Arc<dyn SignalConnector>,
) -> Result<(HandshakeOutcome, Box<dyn SignalChannel>), HandshakeError> {
    let mut channel = connector.connect(&route.endpoint).await.map_err(|err| {
        debug!(error = %err, endpoint = %route.endpoint, "signaling connect failed");
        HandshakeError::Timeout
    })?;
    match handshake::run(&identity, &route, channel.as_mut()).await {
        Ok(outcome) => Ok((outcome, channel)),
        Err(err) => {
            let _ = channel.close().await;
            Err(err)
        }
    }
}

fn discard_attempt(done: AttemptDone) {
    if let Ok((_, mut channel)) = done.result {
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
    }
}

/// Owns the signaling channel after the handshake: writes queued messages,
/// forwards inbound ones, exits when either side goes away
async fn pump_signals(
    mut channel: Box<dyn SignalChannel>,
    mut out_rx: mpsc::UnboundedReceiver<SignalMessage>,
    in_tx: mpsc::UnboundedSender<SignalMessage>,
) {
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(err) = channel.send(message).await {
                        debug!(error = %err, "signal send failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = channel.recv() => match inbound {
                Ok(Some(message)) => {
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("server closed the control channel");
                    break;
                }
                Err(err) => {
                    debug!(error = %err, "signal read failed");
                    break;
                }
            },
        }
    }
    let _ = channel.close().await;
}

/// Pull from an optional inbox; parks forever while there is none
async fn recv_signal(
    signal_in: &mut Option<mpsc::UnboundedReceiver<SignalMessage>>,
) -> Option<SignalMessage> {
    match signal_in {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SilenceSource;
    use tokio::time::timeout;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity {
            user_id: "u".to_string(),
            group_id: "g".to_string(),
            session_id: "s".to_string(),
        }
    }

    fn silence() -> Box<dyn AudioSource> {
        Box::new(SilenceSource::frames(2))
    }

    #[tokio::test]
    async fn test_play_without_route_is_not_ready() {
        let (connection, _events) = Connection::new(identity());
        let err = connection.play(silence()).await.unwrap_err();
        assert_eq!(err, PlayError::NotReady);
        assert!(!connection.is_playing());
        connection.close().await;
    }

    #[tokio::test]
    async fn test_stop_when_idle_returns_immediately() {
        let (connection, _events) = Connection::new(identity());
        timeout(Duration::from_secs(1), connection.stop())
            .await
            .unwrap();
        connection.close().await;
    }

    #[tokio::test]
    async fn test_close_twice_emits_one_closed_event() {
        let (connection, mut events) = Connection::new(identity());
        connection.close().await;
        connection.close().await;

        match events.recv().await {
            Some(ConnectionEvent::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(events.recv().await.is_none());

        let err = connection.play(silence()).await.unwrap_err();
        assert_eq!(err, PlayError::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_route_times_out_and_retries_once() {
        let (connection, mut events) = Connection::new(identity());
        connection.set_route(ServerRoute {
            endpoint: "127.0.0.1:1".to_string(),
            token: "t".to_string(),
        });

        for _ in 0..2 {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(ConnectionEvent::HandshakeFailed(HandshakeError::Timeout)) => {}
                other => panic!("expected a timeout, got {other:?}"),
            }
        }
        // the single retry is spent; nothing further arrives
        assert!(
            timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err()
        );
        connection.close().await;
    }
}
