//! Protocol session, outbound topic calls and inbound bridge dispatch.

use semver::Version;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::codec::{declared_reply_len, decode_reply, encode_topic_frame, TopicCommand};
use crate::types::{Error, Result, SessionSecret, TransportConfig};

/// API generation this warden speaks. Engines must match major and minor.
pub const SUPPORTED_API_VERSION: (u64, u64) = (5, 1);

/// Parse a reported API version. `X.Y` is accepted as `X.Y.0`.
pub fn parse_api_version(raw: &str) -> Result<Version> {
    let raw = raw.trim();
    Version::parse(raw)
        .or_else(|_| Version::parse(&format!("{raw}.0")))
        .map_err(|e| Error::validation(format!("invalid API version '{}': {}", raw, e)))
}

pub fn is_compatible(version: &Version) -> bool {
    (version.major, version.minor) == SUPPORTED_API_VERSION
}

/// Callbacks the gateway forwards to the host after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The engine asks to be killed and relaunched.
    KillRequested,
    /// Relay text to every chat channel.
    Broadcast(String),
    /// Relay text to admin channels only.
    AdminBroadcast(String),
    /// The engine finished an in-process reboot.
    WorldRebooted,
}

/// What happened to one bridge command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    Handled,
    /// Unknown first token.
    Ignored,
    /// Known command refused because no compatible version is negotiated.
    Dropped,
}

/// Negotiated state of the currently connected engine instance.
#[derive(Debug, Clone, Default)]
pub struct ProtocolSession {
    pub api_version: Option<Version>,
    pub secret: SessionSecret,
}

#[derive(Debug)]
struct GatewayInner {
    config: TransportConfig,
    session: Mutex<ProtocolSession>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

/// Encodes/decodes the engine wire protocol and tracks compatibility.
#[derive(Debug, Clone)]
pub struct TransportGateway {
    inner: Arc<GatewayInner>,
}

impl TransportGateway {
    /// Create a gateway and the receiver for validated bridge events.
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Self {
            inner: Arc::new(GatewayInner {
                config,
                session: Mutex::new(ProtocolSession::default()),
                events: tx,
            }),
        };
        (gateway, rx)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    fn session(&self) -> std::sync::MutexGuard<'_, ProtocolSession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mint a fresh secret for a process about to launch. Version unknown.
    pub fn begin_session(&self) -> SessionSecret {
        let mut session = self.session();
        *session = ProtocolSession::default();
        session.secret.clone()
    }

    /// Forget the negotiated version (process exited or reported garbage).
    pub fn reset_session(&self) {
        self.session().api_version = None;
    }

    /// Take over the secret a still-running engine was launched with.
    /// Version unknown until it reports again.
    pub fn adopt_session(&self, secret: SessionSecret) {
        *self.session() = ProtocolSession {
            api_version: None,
            secret,
        };
    }

    pub fn session_secret(&self) -> SessionSecret {
        self.session().secret.clone()
    }

    pub fn api_version(&self) -> Option<Version> {
        self.session().api_version.clone()
    }

    pub fn is_negotiated(&self) -> bool {
        self.session().api_version.as_ref().is_some_and(is_compatible)
    }

    /// Send one topic command and return the decoded reply.
    pub async fn send_topic(&self, command: TopicCommand) -> Result<String> {
        let (secret, version) = {
            let session = self.session();
            (session.secret.clone(), session.api_version.clone())
        };
        match version {
            None => {
                return Err(Error::protocol(
                    "engine API version not negotiated; topic call skipped",
                ))
            }
            Some(v) if !is_compatible(&v) => {
                return Err(Error::protocol(format!(
                    "engine API version {} is incompatible; topic call skipped",
                    v
                )))
            }
            Some(_) => {}
        }

        let params = command.to_params(secret.as_str());
        let frame = encode_topic_frame(&params)?;
        tracing::debug!(command = ?command.name(), bytes = frame.len(), "sending topic");

        let reply = self.call(&frame).await?;
        Ok(decode_reply(&reply))
    }

    async fn call(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let config = &self.inner.config;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.topic_port));
        let deadline = Instant::now() + config.call_timeout;
        let timed_out = || {
            Error::timeout(format!(
                "topic call to {} exceeded {}ms",
                addr,
                config.call_timeout.as_millis()
            ))
        };

        let send = async {
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                Error::protocol(format!("cannot reach engine on {}: {}", addr, e))
            })?;
            stream.write_all(frame).await?;
            stream.flush().await?;
            Ok::<_, Error>(stream)
        };
        let mut stream = tokio::time::timeout_at(deadline, send)
            .await
            .map_err(|_| timed_out())??;

        let reply = read_reply(&mut stream, config.max_reply_bytes, deadline).await?;
        reply.ok_or_else(timed_out)
    }

    /// Validate and dispatch one bridge command string.
    pub fn handle_bridge(&self, command: &str) -> BridgeOutcome {
        let command = command.trim_end_matches(['\r', '\n']);
        let (head, payload) = command.split_once(' ').unwrap_or((command, ""));

        if head == "api_ver" {
            self.handle_version_report(payload);
            return BridgeOutcome::Handled;
        }

        let event = match head {
            "killme" => BridgeEvent::KillRequested,
            "irc" => BridgeEvent::Broadcast(payload.to_string()),
            "send2irc" => BridgeEvent::AdminBroadcast(payload.to_string()),
            "worldreboot" => BridgeEvent::WorldRebooted,
            other => {
                tracing::debug!(command = other, "ignoring unknown bridge command");
                return BridgeOutcome::Ignored;
            }
        };

        if !self.is_negotiated() {
            tracing::warn!(
                command = head,
                "dropping bridge callback: no compatible API version negotiated"
            );
            return BridgeOutcome::Dropped;
        }

        if self.inner.events.send(event).is_err() {
            tracing::debug!(command = head, "bridge event receiver closed");
        }
        BridgeOutcome::Handled
    }

    fn handle_version_report(&self, payload: &str) {
        let version = match parse_api_version(payload) {
            Ok(v) if is_compatible(&v) => v,
            Ok(v) => {
                tracing::warn!(
                    reported = %v,
                    supported = ?SUPPORTED_API_VERSION,
                    "engine reported an incompatible API version"
                );
                self.reset_session();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "engine reported an unparseable API version");
                self.reset_session();
                return;
            }
        };

        tracing::info!(version = %version, "engine API version negotiated");
        self.session().api_version = Some(version.clone());

        let gateway = self.clone();
        let ack = async move {
            let command = TopicCommand::ApiCompatible {
                version: version.to_string(),
            };
            if let Err(e) = gateway.send_topic(command).await {
                tracing::warn!(error = %e, "API compatibility acknowledgment failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(ack);
            }
            Err(_) => tracing::warn!("no async runtime; API compatibility acknowledgment skipped"),
        }
    }
}

/// Read a reply: until EOF, until `max` bytes, or until the length a reply
/// header announces has arrived. Hitting `deadline` keeps what arrived;
/// `None` when nothing did.
async fn read_reply(
    stream: &mut TcpStream,
    max: usize,
    deadline: Instant,
) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
            Ok(read) => read?,
            Err(_) if filled > 0 => {
                tracing::debug!(bytes = filled, "topic reply read timed out; using partial reply");
                break;
            }
            Err(_) => return Ok(None),
        };
        if n == 0 {
            break;
        }
        filled += n;
        if declared_reply_len(&buf[..filled]).is_some_and(|want| filled >= want) {
            break;
        }
    }
    buf.truncate(filled);
    Ok(Some(buf))
}
