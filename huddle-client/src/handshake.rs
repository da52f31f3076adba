//! Session handshake state machine
//!
//! Turns (identity, route) into transport key material over the signaling
//! channel: identify with the one-time token, learn our routing id and the
//! server's mode list, discover our externally visible address through the
//! voice socket, then submit address + chosen mode and wait for the session
//! description that carries the key.
//!
//! State order: `Idle -> Identifying -> DiscoveringAddress ->
//! NegotiatingProtocol -> Ready`, with `Failed` terminal on any error.
//! Supersede handling lives in the connection task: it aborts a pending
//! attempt outright and reports `Superseded` itself.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use huddle_common::signal::{
    EncryptionMode, Identify, Ready, Rejected, SelectProtocol, SelectProtocolData,
    SessionDescription, SignalMessage, op,
};

use crate::crypto::TransportKey;
use crate::error::HandshakeError;
use crate::signaling::SignalChannel;

/// Longest wait for any single control-channel reply
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for one discovery reply before resending the probe
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Discovery probes sent before the attempt fails
pub const DISCOVERY_ATTEMPTS: u32 = 3;

/// Size of a discovery probe and its reply in bytes
pub const DISCOVERY_PACKET_LEN: usize = 70;

// =============================================================================
// Types
// =============================================================================

/// Identity of this client within one voice session
///
/// Supplied at connection creation and immutable afterwards; it becomes the
/// identify payload of every handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub group_id: String,
    pub session_id: String,
}

/// Where to reach the session's voice server, and the token that admits us
///
/// Routes may be re-supplied mid-session (migration); each new route
/// supersedes any handshake still in flight.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerRoute {
    /// Signaling endpoint as `host:port`
    pub endpoint: String,
    /// One-time session token
    pub token: String,
}

impl fmt::Debug for ServerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRoute")
            .field("endpoint", &self.endpoint)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// States a handshake attempt moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Identifying,
    DiscoveringAddress,
    NegotiatingProtocol,
    Ready,
    Failed,
}

/// Everything a completed handshake yields
#[derive(Debug)]
pub(crate) struct HandshakeOutcome {
    pub key: TransportKey,
    pub routing_id: u32,
    /// Externally visible address of the voice socket, as discovered
    pub external_addr: SocketAddr,
    /// Voice socket, bound and connected to the server's voice endpoint
    pub socket: UdpSocket,
    /// Keepalive cadence the server asked for
    pub heartbeat_interval: Duration,
}

// =============================================================================
// State Machine
// =============================================================================

/// Run one handshake attempt to completion over the given channel
pub(crate) async fn run(
    identity: &ConnectionIdentity,
    route: &ServerRoute,
    channel: &mut dyn SignalChannel,
) -> Result<HandshakeOutcome, HandshakeError> {
    match run_states(identity, route, channel).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            debug!(state = ?HandshakeState::Failed, error = %err, "handshake failed");
            Err(err)
        }
    }
}

async fn run_states(
    identity: &ConnectionIdentity,
    route: &ServerRoute,
    channel: &mut dyn SignalChannel,
) -> Result<HandshakeOutcome, HandshakeError> {
    // Identifying: present credentials, wait for the server's Ready
    transition(HandshakeState::Idle, HandshakeState::Identifying);
    let identify = Identify {
        group_id: identity.group_id.clone(),
        user_id: identity.user_id.clone(),
        session_id: identity.session_id.clone(),
        token: route.token.clone(),
    };
    send_signal(channel, op::IDENTIFY, &identify).await?;

    let ready: Ready = loop {
        let message = next_signal(channel).await?;
        match message.op {
            op::READY => break parse_payload(&message)?,
            op::REJECTED => {
                let rejected: Rejected = message.payload().unwrap_or_default();
                return Err(HandshakeError::AuthRejected(rejected.reason));
            }
            other => debug!(op = other, "ignoring signal while identifying"),
        }
    };

    // DiscoveringAddress: the server must learn our true source address,
    // which only the voice socket itself can reveal
    transition(
        HandshakeState::Identifying,
        HandshakeState::DiscoveringAddress,
    );
    let remote = resolve_voice_addr(&route.endpoint, ready.port).await?;
    let socket = bind_voice_socket(&remote).await?;
    let external_addr = discover_external_addr(&socket, ready.routing_id).await?;

    // NegotiatingProtocol: pick the strongest shared mode, submit our
    // address, and wait for the key
    transition(
        HandshakeState::DiscoveringAddress,
        HandshakeState::NegotiatingProtocol,
    );
    let Some(mode) = EncryptionMode::negotiate(&ready.modes) else {
        debug!(offered = ?ready.modes, "no mutually supported encryption mode");
        return Err(HandshakeError::ProtocolMismatch);
    };
    let select = SelectProtocol {
        protocol: "udp".to_string(),
        data: SelectProtocolData {
            address: external_addr.ip().to_string(),
            port: external_addr.port(),
            mode: mode.as_str().to_string(),
        },
    };
    send_signal(channel, op::SELECT_PROTOCOL, &select).await?;

    let description: SessionDescription = loop {
        let message = next_signal(channel).await?;
        match message.op {
            op::SESSION_DESCRIPTION => break parse_payload(&message)?,
            op::REJECTED => {
                let rejected: Rejected = message.payload().unwrap_or_default();
                return Err(HandshakeError::AuthRejected(rejected.reason));
            }
            other => debug!(op = other, "ignoring signal while negotiating"),
        }
    };

    // The description's mode is authoritative; it must still be one we know
    let Some(final_mode) = EncryptionMode::parse(&description.mode) else {
        debug!(mode = %description.mode, "server settled on an unknown mode");
        return Err(HandshakeError::ProtocolMismatch);
    };
    let Some(key) = TransportKey::from_slice(&description.secret_key, final_mode) else {
        debug!(
            len = description.secret_key.len(),
            "session description key has wrong length"
        );
        return Err(HandshakeError::ProtocolMismatch);
    };

    transition(HandshakeState::NegotiatingProtocol, HandshakeState::Ready);
    Ok(HandshakeOutcome {
        key,
        routing_id: ready.routing_id,
        external_addr,
        socket,
        // floor pathological keepalive intervals
        heartbeat_interval: Duration::from_millis(ready.heartbeat_interval_ms.max(1_000)),
    })
}

fn transition(from: HandshakeState, to: HandshakeState) {
    debug!(?from, ?to, "handshake state");
}

// =============================================================================
// Control-channel Steps
// =============================================================================

async fn send_signal<T: Serialize>(
    channel: &mut dyn SignalChannel,
    op_code: u8,
    payload: &T,
) -> Result<(), HandshakeError> {
    let message = SignalMessage::encode(op_code, payload).map_err(|e| {
        debug!(op = op_code, error = %e, "signal encode failed");
        HandshakeError::ProtocolMismatch
    })?;
    channel.send(message).await.map_err(|e| {
        debug!(op = op_code, error = %e, "control channel send failed");
        HandshakeError::Timeout
    })
}

async fn next_signal(channel: &mut dyn SignalChannel) -> Result<SignalMessage, HandshakeError> {
    match timeout(STEP_TIMEOUT, channel.recv()).await {
        Err(_) => Err(HandshakeError::Timeout),
        Ok(Err(err)) => {
            debug!(error = %err, "control channel read failed");
            Err(HandshakeError::Timeout)
        }
        Ok(Ok(None)) => {
            debug!("control channel closed during handshake");
            Err(HandshakeError::Timeout)
        }
        Ok(Ok(Some(message))) => Ok(message),
    }
}

fn parse_payload<T: DeserializeOwned>(message: &SignalMessage) -> Result<T, HandshakeError> {
    message.payload().map_err(|e| {
        debug!(op = message.op, error = %e, "malformed signal payload");
        HandshakeError::ProtocolMismatch
    })
}

// =============================================================================
// Address Discovery
// =============================================================================

async fn resolve_voice_addr(endpoint: &str, port: u16) -> Result<SocketAddr, HandshakeError> {
    let host = endpoint.rsplit_once(':').map_or(endpoint, |(host, _)| host);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().ok_or(HandshakeError::Timeout),
        Err(err) => {
            debug!(error = %err, host, "voice endpoint resolution failed");
            Err(HandshakeError::Timeout)
        }
    }
}

async fn bind_voice_socket(remote: &SocketAddr) -> Result<UdpSocket, HandshakeError> {
    let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
        debug!(error = %e, "voice socket bind failed");
        HandshakeError::Timeout
    })?;
    socket.connect(remote).await.map_err(|e| {
        debug!(error = %e, remote = %remote, "voice socket connect failed");
        HandshakeError::Timeout
    })?;
    Ok(socket)
}

/// Probe the voice endpoint until it echoes our externally visible address
///
/// Probe: 70 bytes, routing id big-endian at [0..4], rest zero. Reply: 70
/// bytes, address as NUL-terminated ASCII at [4..20], port little-endian at
/// [68..70].
async fn discover_external_addr(
    socket: &UdpSocket,
    routing_id: u32,
) -> Result<SocketAddr, HandshakeError> {
    let mut probe = [0u8; DISCOVERY_PACKET_LEN];
    probe[..4].copy_from_slice(&routing_id.to_be_bytes());

    for attempt in 1..=DISCOVERY_ATTEMPTS {
        if let Err(err) = socket.send(&probe).await {
            debug!(error = %err, attempt, "discovery probe send failed");
            continue;
        }

        let mut reply = [0u8; DISCOVERY_PACKET_LEN];
        match timeout(DISCOVERY_TIMEOUT, socket.recv(&mut reply)).await {
            Err(_) => debug!(attempt, "discovery reply timed out"),
            Ok(Err(err)) => debug!(error = %err, attempt, "discovery recv failed"),
            Ok(Ok(n)) if n < DISCOVERY_PACKET_LEN => {
                debug!(len = n, attempt, "runt discovery reply");
            }
            Ok(Ok(_)) => {
                return parse_discovery_reply(&reply).ok_or(HandshakeError::ProtocolMismatch);
            }
        }
    }
    Err(HandshakeError::Timeout)
}

fn parse_discovery_reply(reply: &[u8; DISCOVERY_PACKET_LEN]) -> Option<SocketAddr> {
    let field = &reply[4..20];
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let address = std::str::from_utf8(&field[..len]).ok()?;
    let ip: IpAddr = address.parse().ok()?;

    let port = u16::from_le_bytes([reply[68], reply[69]]);
    if port == 0 {
        return None;
    }
    Some(SocketAddr::new(ip, port))
}
