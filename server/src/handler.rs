//! Per-role connection handlers and the request-serving loop they build on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::{Map, Value};

use shared::error::Error;
use shared::message::{Message, MessageKind, Outcome, Role, EXIT_COMMAND};
use shared::FrameTransport;

/// One accepted connection after a successful handshake.
pub struct Connection {
    pub transport: Arc<FrameTransport>,
    pub role: Role,
    pub peer: String,
}

/// Drives one accepted connection of its role until the connection ends.
/// Selected from the listener's registry at handshake time.
pub trait RoleHandler: Send + Sync {
    fn handle(&self, conn: Connection);
}

/// Outcome of one command dispatch: success params or a failure reason.
pub type CommandResult = std::result::Result<Map<String, Value>, String>;

/// Maps a request's `{command, params}` to a response.
pub trait CommandHandler: Send + Sync {
    fn dispatch(&self, command: &str, params: &Map<String, Value>) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: Fn(&str, &Map<String, Value>) -> CommandResult + Send + Sync,
{
    fn dispatch(&self, command: &str, params: &Map<String, Value>) -> CommandResult {
        self(command, params)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// Read timeout of the serving loop; bounds how often liveness is checked.
    pub receive_timeout: Duration,
    /// The connection is dropped when nothing arrives for this long.
    pub heartbeat_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a serving loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer announced an EXIT and was acknowledged.
    Exit,
    /// Nothing arrived within the heartbeat timeout.
    HeartbeatTimeout,
    /// The socket closed or failed.
    ConnectionClosed,
}

/// Responder loop for role handlers: answers heartbeats, dispatches request
/// commands, acknowledges EXIT, and drops peers that go silent.
pub fn serve_requests(
    conn: &Connection,
    commands: &dyn CommandHandler,
    options: ServeOptions,
) -> SessionEnd {
    if let Err(e) = conn.transport.set_read_timeout(options.receive_timeout) {
        warn!("[{}] setting read timeout: {}", conn.peer, e);
        return SessionEnd::ConnectionClosed;
    }
    let mut deadline = Instant::now() + options.heartbeat_timeout;

    loop {
        let bytes = match conn.transport.receive() {
            Ok(bytes) => bytes,
            Err(Error::Timeout) => {
                if Instant::now() >= deadline {
                    warn!("[{}] no traffic within heartbeat timeout", conn.peer);
                    return SessionEnd::HeartbeatTimeout;
                }
                continue;
            }
            Err(e) => {
                info!("[{}] connection ended: {}", conn.peer, e);
                return SessionEnd::ConnectionClosed;
            }
        };
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] dropping malformed message: {}", conn.peer, e);
                continue;
            }
        };
        // Any well-formed traffic proves the peer is alive.
        deadline = Instant::now() + options.heartbeat_timeout;

        match message.kind {
            MessageKind::Heartbeat => {
                let reply = Message::response(&message.id, Outcome::Success, None);
                if send(conn, &reply).is_err() {
                    return SessionEnd::ConnectionClosed;
                }
            }
            MessageKind::Request => {
                let Some(command) = message.command().map(str::to_owned) else {
                    let reply = Message::failure(&message.id, "request carries no command");
                    if send(conn, &reply).is_err() {
                        return SessionEnd::ConnectionClosed;
                    }
                    continue;
                };
                if command == EXIT_COMMAND {
                    let reply = Message::response(&message.id, Outcome::Success, None);
                    let _ = send(conn, &reply);
                    info!("[{}] peer announced exit", conn.peer);
                    return SessionEnd::Exit;
                }
                let params = message
                    .params()
                    .cloned()
                    .unwrap_or_default();
                debug!("[{}] dispatching command '{}'", conn.peer, command);
                let reply = match commands.dispatch(&command, &params) {
                    Ok(result) => Message::response(&message.id, Outcome::Success, Some(result)),
                    Err(reason) => Message::failure(&message.id, &reason),
                };
                if send(conn, &reply).is_err() {
                    return SessionEnd::ConnectionClosed;
                }
            }
            other => {
                debug!("[{}] ignoring {} message", conn.peer, other.as_str());
            }
        }
    }
}

fn send(conn: &Connection, message: &Message) -> shared::Result<()> {
    let bytes = message.encode()?;
    conn.transport.send(&bytes).map_err(|e| {
        info!("[{}] send failed: {}", conn.peer, e);
        e
    })
}
