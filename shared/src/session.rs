//! Outbound connection lifecycle: connect with retry, role handshake with
//! retry, and a supervising loop that runs one peer worker per established
//! session and reconnects after connection loss.
//!
//! A fresh transport and a fresh worker are constructed for every attempt;
//! nothing is reused across reconnects. Connect or handshake exhaustion fires
//! `on_connect_failed` once and halts the supervisor; loss after a successful
//! handshake loops back into connect-with-retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::framing::FrameTransport;
use crate::message::{keys, outcome_of, Message, MessageKind, Role, EXIT_COMMAND};
use crate::worker::{LossHook, MessageHook, PeerWorker, WorkerConfig, WorkerHooks};

/// Cadence of the session loop's stop/loss check.
const SESSION_POLL: Duration = Duration::from_millis(200);

/// Construction-time options for one outbound leg.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Read timeout of the control channel once connected.
    pub receive_timeout: Duration,
    /// Per-call deadline for requests through [`Connector::request`].
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_patience: u32,
    /// `None` retries forever, for supervisory legs that must eventually
    /// reconnect, like a server's database-facing connection.
    pub max_connect_attempts: Option<u32>,
    pub max_handshake_attempts: u32,
    /// Sleep between connect and handshake retries.
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            receive_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_patience: 3,
            max_connect_attempts: Some(5),
            max_handshake_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle callbacks. `on_message` and `on_connection_lost` are forwarded
/// to every worker the supervisor creates.
#[derive(Default, Clone)]
pub struct ConnectorHooks {
    pub on_connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_connect_failed: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_connection_lost: Option<LossHook>,
    pub on_message: Option<MessageHook>,
}

struct ConnectorInner {
    addr: String,
    role: Role,
    config: SessionConfig,
    hooks: ConnectorHooks,
    stop: AtomicBool,
    worker: Mutex<Option<Arc<PeerWorker>>>,
}

/// One supervised outbound connection declaring `role` to `addr`.
pub struct Connector {
    inner: Arc<ConnectorInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(
        addr: impl Into<String>,
        role: Role,
        config: SessionConfig,
        hooks: ConnectorHooks,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                addr: addr.into(),
                role,
                config,
                hooks,
                stop: AtomicBool::new(true),
                worker: Mutex::new(None),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn the supervisor thread. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Ok(());
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(
            thread::Builder::new()
                .name("connector".to_owned())
                .spawn(move || inner.run())?,
        );
        Ok(())
    }

    /// Halt the supervisor and tear down the current session, preventing any
    /// further reconnect attempt. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                error!("connector supervisor panicked");
            }
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.stop();
        }
    }

    /// Send a request over the live session and await its response.
    pub fn request(&self, kind: MessageKind, data: Map<String, Value>) -> Result<Map<String, Value>> {
        let worker = self
            .inner
            .worker
            .lock()
            .clone()
            .ok_or(Error::ConnectionLost)?;
        worker.pend_and_wait(kind, data, Some(self.inner.config.response_timeout))
    }

    /// Send a `{command, params}` REQUEST.
    pub fn command(&self, command: &str, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut data = Map::new();
        data.insert(keys::COMMAND.to_owned(), Value::String(command.to_owned()));
        data.insert(keys::PARAMS.to_owned(), Value::Object(params));
        self.request(MessageKind::Request, data)
    }

    /// Best-effort EXIT request before a voluntary shutdown, so the peer can
    /// release its per-connection state first. Failures are logged, not fatal.
    pub fn announce_exit(&self) {
        let worker = self.inner.worker.lock().clone();
        let Some(worker) = worker else { return };
        if worker.is_lost() {
            return;
        }
        let mut data = Map::new();
        data.insert(
            keys::COMMAND.to_owned(),
            Value::String(EXIT_COMMAND.to_owned()),
        );
        data.insert(keys::PARAMS.to_owned(), Value::Object(Map::new()));
        match worker.pend_and_wait(
            MessageKind::Request,
            data,
            Some(self.inner.config.response_timeout),
        ) {
            Ok(response) => match outcome_of(&response) {
                Ok(outcome) if outcome.is_success() => debug!("peer acknowledged exit"),
                _ => warn!("peer did not acknowledge exit"),
            },
            Err(e) => warn!("exit announcement failed: {}", e),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_lost())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ConnectorInner {
    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let Some(transport) = self.connect_with_retry() else {
                self.fail();
                break;
            };
            let Some(transport) = self.handshake_with_retry(transport) else {
                self.fail();
                break;
            };

            let worker = Arc::new(PeerWorker::new(
                transport,
                WorkerConfig {
                    receive_timeout: self.config.receive_timeout,
                    heartbeat_interval: self.config.heartbeat_interval,
                    heartbeat_patience: self.config.heartbeat_patience,
                },
                WorkerHooks {
                    on_message: self.hooks.on_message.clone(),
                    on_connection_lost: self.hooks.on_connection_lost.clone(),
                    make_heartbeat: Some(Arc::new(|| (MessageKind::Heartbeat, Map::new()))),
                },
            ));
            if let Err(e) = worker.start() {
                error!("starting peer worker: {}", e);
                worker.stop();
                continue;
            }
            *self.worker.lock() = Some(Arc::clone(&worker));
            info!("session established with {} as {}", self.addr, self.role);
            if let Some(on_connected) = &self.hooks.on_connected {
                on_connected();
            }

            while !self.stop.load(Ordering::SeqCst) && !worker.is_lost() {
                thread::sleep(SESSION_POLL);
            }

            self.worker.lock().take();
            worker.stop();
            if !self.stop.load(Ordering::SeqCst) {
                info!("session with {} lost, reconnecting", self.addr);
            }
        }
        debug!("connector supervisor exited");
    }

    /// Connect/handshake exhaustion: report once, then halt the supervisor.
    fn fail(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            warn!("giving up on {}", self.addr);
            if let Some(on_connect_failed) = &self.hooks.on_connect_failed {
                on_connect_failed();
            }
        }
    }

    fn connect_with_retry(&self) -> Option<FrameTransport> {
        let mut attempt = 1u32;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            info!("connect attempt {} -> {}", attempt, self.addr);
            match FrameTransport::connect(&self.addr, self.config.connect_timeout) {
                Ok(transport) => {
                    info!("connected to {}", self.addr);
                    return Some(transport);
                }
                Err(e) => {
                    if let Some(max) = self.config.max_connect_attempts {
                        if attempt >= max {
                            warn!("connect to {} failed: {}", self.addr, e);
                            return None;
                        }
                    }
                    warn!("connect to {} failed: {}, retrying", self.addr, e);
                    attempt += 1;
                    // A refused connect returns immediately; pace the retries.
                    if !self.stop.load(Ordering::SeqCst) {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
    }

    fn handshake_with_retry(&self, transport: FrameTransport) -> Option<FrameTransport> {
        for attempt in 1..=self.config.max_handshake_attempts {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            info!("handshake attempt {} as {}", attempt, self.role);
            match self.handshake_once(&transport) {
                Ok(()) => return Some(transport),
                Err(e) => {
                    warn!("handshake failed: {}", e);
                    if attempt < self.config.max_handshake_attempts
                        && !self.stop.load(Ordering::SeqCst)
                    {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        transport.close();
        None
    }

    fn handshake_once(&self, transport: &FrameTransport) -> Result<()> {
        transport.set_read_timeout(self.config.handshake_timeout)?;
        let hello = Message::handshake(self.role);
        transport.send(&hello.encode()?)?;
        let reply = Message::decode(&transport.receive()?)?;
        if reply.kind != MessageKind::Response {
            return Err(Error::Protocol(format!(
                "expected response, got {}",
                reply.kind.as_str()
            )));
        }
        if reply.responding_id() != Some(hello.id.as_str()) {
            return Err(Error::Protocol(
                "handshake response correlates to a different message".to_owned(),
            ));
        }
        if !reply.outcome()?.is_success() {
            let reason = reply
                .params()
                .and_then(|params| params.get(keys::REASON))
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_owned();
            return Err(Error::Protocol(format!("handshake rejected: {reason}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outcome;
    use serde_json::json;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn quick_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            receive_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_patience: 3,
            max_connect_attempts: Some(2),
            max_handshake_attempts: 2,
            retry_delay: Duration::from_millis(50),
        }
    }

    fn counting_hook(counter: &Arc<AtomicUsize>) -> Arc<dyn Fn() + Send + Sync> {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Accept one connection and answer its handshake, then serve heartbeats
    /// and echo every request's params back as success params.
    fn serve_one_session(listener: &TcpListener) {
        let (stream, _) = listener.accept().unwrap();
        let transport = FrameTransport::from_stream(stream);
        let hello = Message::decode(&transport.receive().unwrap()).unwrap();
        assert_eq!(hello.kind, MessageKind::Handshake);
        transport
            .send(
                &Message::response(&hello.id, Outcome::Success, None)
                    .encode()
                    .unwrap(),
            )
            .unwrap();
        loop {
            let bytes = match transport.receive() {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            let message = Message::decode(&bytes).unwrap();
            let params = message.params().cloned().unwrap_or_default();
            let reply = Message::response(&message.id, Outcome::Success, Some(params));
            if transport.send(&reply.encode().unwrap()).is_err() {
                break;
            }
            if message.command() == Some(EXIT_COMMAND) {
                break;
            }
        }
        transport.close();
    }

    #[test]
    fn test_connect_exhaustion_fires_failure_once() {
        // Bind then drop to get a port nobody is listening on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let failures = Arc::new(AtomicUsize::new(0));
        let connector = Connector::new(
            format!("127.0.0.1:{port}"),
            Role::Player,
            quick_config(),
            ConnectorHooks {
                on_connect_failed: Some(counting_hook(&failures)),
                ..ConnectorHooks::default()
            },
        );
        connector.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !connector.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(connector.is_stopped());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        connector.stop();
    }

    #[test]
    fn test_handshake_rejection_exhausts_and_fires_failure_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Reject every handshake on a single accepted connection.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = FrameTransport::from_stream(stream);
            let mut rejected = 0;
            while rejected < 2 {
                let hello = match transport.receive() {
                    Ok(bytes) => Message::decode(&bytes).unwrap(),
                    Err(_) => break,
                };
                let reply = Message::failure(&hello.id, "unrecognized role 'player'");
                if transport.send(&reply.encode().unwrap()).is_err() {
                    break;
                }
                rejected += 1;
            }
            rejected
        });

        let failures = Arc::new(AtomicUsize::new(0));
        let connector = Connector::new(
            addr.to_string(),
            Role::Player,
            quick_config(),
            ConnectorHooks {
                on_connect_failed: Some(counting_hook(&failures)),
                ..ConnectorHooks::default()
            },
        );
        connector.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !connector.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(connector.is_stopped());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(server.join().unwrap(), 2);
        connector.stop();
    }

    #[test]
    fn test_session_established_and_commands_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || serve_one_session(&listener));

        let connected = Arc::new(AtomicUsize::new(0));
        let connector = Connector::new(
            addr.to_string(),
            Role::Player,
            quick_config(),
            ConnectorHooks {
                on_connected: Some(counting_hook(&connected)),
                ..ConnectorHooks::default()
            },
        );
        connector.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !connector.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(connector.is_connected());
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        let mut params = Map::new();
        params.insert("username".to_owned(), json!("alice"));
        let response = connector.command("login", params).unwrap();
        assert!(outcome_of(&response).unwrap().is_success());
        assert_eq!(response["params"]["username"], json!("alice"));

        connector.announce_exit();
        connector.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_reconnect_after_loss_and_stop_prevents_more() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handshakes = Arc::new(AtomicUsize::new(0));
        let server_count = Arc::clone(&handshakes);
        // Accept sessions forever, answering each handshake and then closing
        // immediately, which the client observes as connection loss.
        let server = thread::spawn(move || {
            listener
                .set_nonblocking(false)
                .expect("blocking accept loop");
            while let Ok((stream, _)) = listener.accept() {
                let transport = FrameTransport::from_stream(stream);
                let hello = match transport.receive() {
                    Ok(bytes) => Message::decode(&bytes).unwrap(),
                    Err(_) => continue,
                };
                transport
                    .send(
                        &Message::response(&hello.id, Outcome::Success, None)
                            .encode()
                            .unwrap(),
                    )
                    .unwrap();
                server_count.fetch_add(1, Ordering::SeqCst);
                transport.close();
            }
        });

        let connector = Connector::new(
            addr.to_string(),
            Role::Player,
            SessionConfig {
                max_connect_attempts: None,
                ..quick_config()
            },
            ConnectorHooks::default(),
        );
        connector.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while handshakes.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(
            handshakes.load(Ordering::SeqCst) >= 2,
            "expected at least one reconnect"
        );

        connector.stop();
        let after_stop = handshakes.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(600));
        assert_eq!(handshakes.load(Ordering::SeqCst), after_stop);
        drop(server);
    }
}
