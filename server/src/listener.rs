//! Inbound connection lifecycle: accept loop, role handshake acceptance, and
//! hand-off to the registered per-role handler.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;

use shared::error::{Error, Result};
use shared::message::{keys, Message, MessageKind, Outcome, Role};
use shared::FrameTransport;

use crate::handler::{Connection, RoleHandler};

#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// The first frame of a connection must arrive within this window and be
    /// a handshake.
    pub handshake_timeout: Duration,
    /// Poll cadence of the non-blocking accept loop.
    pub accept_poll: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(3),
            accept_poll: Duration::from_millis(100),
        }
    }
}

struct ListenerInner {
    listener: TcpListener,
    handlers: HashMap<Role, Arc<dyn RoleHandler>>,
    config: ListenerConfig,
    stop: AtomicBool,
    live: Mutex<Vec<Weak<FrameTransport>>>,
    accepted: AtomicU64,
}

/// Accepts connections, gates them through the role handshake, and runs one
/// handler thread per accepted peer.
pub struct Listener {
    inner: Arc<ListenerInner>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn bind(
        addr: &str,
        handlers: HashMap<Role, Arc<dyn RoleHandler>>,
        config: ListenerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            inner: Arc::new(ListenerInner {
                listener,
                handlers,
                config,
                stop: AtomicBool::new(false),
                live: Mutex::new(Vec::new()),
                accepted: AtomicU64::new(0),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.listener.local_addr()?)
    }

    /// Spawn the accept loop. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut accept_thread = self.accept_thread.lock();
        if accept_thread.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        *accept_thread = Some(
            thread::Builder::new()
                .name("accept".to_owned())
                .spawn(move || inner.accept_loop())?,
        );
        Ok(())
    }

    /// Stop accepting and close every live connection. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                error!("accept loop panicked");
            }
        }
        let live = std::mem::take(&mut *self.inner.live.lock());
        for transport in live.iter().filter_map(Weak::upgrade) {
            transport.close();
        }
        info!("listener stopped");
    }

    /// Connections whose handler thread is still holding the transport.
    pub fn active_connections(&self) -> usize {
        self.inner
            .live
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ListenerInner {
    fn accept_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("[{}] rejected: {}", peer, e);
                        continue;
                    }
                    let n = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("[{}] accepted (connection #{})", peer, n);
                    let transport = Arc::new(FrameTransport::from_stream(stream));
                    self.track(&transport);
                    let inner = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name(format!("conn-{n}"))
                        .spawn(move || inner.serve_connection(transport, peer));
                    if let Err(e) = spawned {
                        error!("[{}] spawning handler thread: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll);
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    thread::sleep(self.config.accept_poll);
                }
            }
        }
    }

    fn track(&self, transport: &Arc<FrameTransport>) {
        let mut live = self.live.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(transport));
    }

    fn serve_connection(&self, transport: Arc<FrameTransport>, peer: SocketAddr) {
        match self.accept_handshake(&transport, peer) {
            Ok(role) => {
                // Registration was checked during the handshake.
                if let Some(handler) = self.handlers.get(&role) {
                    info!("[{}] joined as {}", peer, role);
                    handler.handle(Connection {
                        transport: Arc::clone(&transport),
                        role,
                        peer: peer.to_string(),
                    });
                    info!("[{}] handler finished", peer);
                }
            }
            Err(e) => info!("[{}] handshake refused: {}", peer, e),
        }
        transport.close();
    }

    /// Gate the first frame: it must be a timely HANDSHAKE naming a role this
    /// listener serves. The peer always learns why it was turned away.
    fn accept_handshake(&self, transport: &FrameTransport, peer: SocketAddr) -> Result<Role> {
        transport.set_read_timeout(self.config.handshake_timeout)?;
        let message = Message::decode(&transport.receive()?)?;
        if message.kind != MessageKind::Handshake {
            return self.refuse(
                transport,
                &message.id,
                format!("expected handshake, got {}", message.kind.as_str()),
            );
        }
        let Some(declared) = message.data.get(keys::ROLE).and_then(|v| v.as_str()) else {
            return self.refuse(transport, &message.id, "handshake carries no role".to_owned());
        };
        let role = match Role::parse(declared) {
            Ok(role) => role,
            Err(_) => {
                return self.refuse(
                    transport,
                    &message.id,
                    format!("unrecognized role '{declared}'"),
                );
            }
        };
        if !self.handlers.contains_key(&role) {
            return self.refuse(transport, &message.id, format!("role '{role}' not served here"));
        }
        let accept = Message::response(&message.id, Outcome::Success, None);
        transport.send(&accept.encode()?)?;
        info!("[{}] handshake accepted for role {}", peer, role);
        Ok(role)
    }

    fn refuse(
        &self,
        transport: &FrameTransport,
        responding_id: &str,
        reason: String,
    ) -> Result<Role> {
        let refusal = Message::failure(responding_id, &reason);
        if let Ok(bytes) = refusal.encode() {
            let _ = transport.send(&bytes);
        }
        Err(Error::Protocol(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{serve_requests, CommandResult, ServeOptions};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct EchoHandler;

    impl RoleHandler for EchoHandler {
        fn handle(&self, conn: Connection) {
            serve_requests(
                &conn,
                &|_: &str, params: &Map<String, Value>| -> CommandResult { Ok(params.clone()) },
                ServeOptions {
                    receive_timeout: Duration::from_millis(100),
                    heartbeat_timeout: Duration::from_secs(5),
                },
            );
        }
    }

    struct CountingHandler(Arc<AtomicUsize>);

    impl RoleHandler for CountingHandler {
        fn handle(&self, _conn: Connection) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn player_registry(handler: Arc<dyn RoleHandler>) -> HashMap<Role, Arc<dyn RoleHandler>> {
        let mut handlers: HashMap<Role, Arc<dyn RoleHandler>> = HashMap::new();
        handlers.insert(Role::Player, handler);
        handlers
    }

    fn quick_config() -> ListenerConfig {
        ListenerConfig {
            handshake_timeout: Duration::from_millis(500),
            accept_poll: Duration::from_millis(20),
        }
    }

    fn start_listener(handlers: HashMap<Role, Arc<dyn RoleHandler>>) -> (Listener, String) {
        let listener = Listener::bind("127.0.0.1:0", handlers, quick_config()).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        listener.start().unwrap();
        (listener, addr)
    }

    fn handshake(transport: &FrameTransport, role: Role) -> Message {
        let hello = Message::handshake(role);
        transport.send(&hello.encode().unwrap()).unwrap();
        let reply = Message::decode(&transport.receive().unwrap()).unwrap();
        assert_eq!(reply.responding_id(), Some(hello.id.as_str()));
        reply
    }

    #[test]
    fn test_registered_role_is_accepted_and_served() {
        let (listener, addr) = start_listener(player_registry(Arc::new(EchoHandler)));
        let transport = FrameTransport::connect(&addr, Duration::from_secs(1)).unwrap();
        transport.set_read_timeout(Duration::from_secs(2)).unwrap();

        let reply = handshake(&transport, Role::Player);
        assert!(reply.outcome().unwrap().is_success());

        let mut params = Map::new();
        params.insert("n".to_owned(), json!(3));
        let request = Message::request("echo", params);
        transport.send(&request.encode().unwrap()).unwrap();
        let reply = Message::decode(&transport.receive().unwrap()).unwrap();
        assert!(reply.outcome().unwrap().is_success());
        assert_eq!(reply.params().unwrap()["n"], json!(3));

        transport.close();
        listener.stop();
    }

    #[test]
    fn test_unregistered_role_is_refused_with_reason() {
        let (listener, addr) = start_listener(player_registry(Arc::new(EchoHandler)));
        let transport = FrameTransport::connect(&addr, Duration::from_secs(1)).unwrap();
        transport.set_read_timeout(Duration::from_secs(2)).unwrap();

        let reply = handshake(&transport, Role::Developer);
        assert!(!reply.outcome().unwrap().is_success());
        let reason = reply.params().unwrap()[keys::REASON].as_str().unwrap();
        assert!(reason.contains("developer"));

        // The listener closes refused connections.
        assert!(matches!(
            transport.receive(),
            Err(Error::ConnectionLost)
        ));
        listener.stop();
    }

    #[test]
    fn test_first_frame_must_be_a_handshake() {
        let (listener, addr) = start_listener(player_registry(Arc::new(EchoHandler)));
        let transport = FrameTransport::connect(&addr, Duration::from_secs(1)).unwrap();
        transport.set_read_timeout(Duration::from_secs(2)).unwrap();

        let request = Message::request("ping", Map::new());
        transport.send(&request.encode().unwrap()).unwrap();
        let reply = Message::decode(&transport.receive().unwrap()).unwrap();
        assert!(!reply.outcome().unwrap().is_success());
        listener.stop();
    }

    #[test]
    fn test_multiple_connections_each_get_a_handler() {
        let served = Arc::new(AtomicUsize::new(0));
        let (listener, addr) =
            start_listener(player_registry(Arc::new(CountingHandler(Arc::clone(&served)))));

        let mut transports = Vec::new();
        for _ in 0..3 {
            let transport = FrameTransport::connect(&addr, Duration::from_secs(1)).unwrap();
            transport.set_read_timeout(Duration::from_secs(2)).unwrap();
            let reply = handshake(&transport, Role::Player);
            assert!(reply.outcome().unwrap().is_success());
            transports.push(transport);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while served.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(served.load(Ordering::SeqCst), 3);
        listener.stop();
        drop(transports);
    }

    #[test]
    fn test_stop_closes_live_connections() {
        let (listener, addr) = start_listener(player_registry(Arc::new(EchoHandler)));
        let transport = FrameTransport::connect(&addr, Duration::from_secs(1)).unwrap();
        transport.set_read_timeout(Duration::from_secs(5)).unwrap();
        let reply = handshake(&transport, Role::Player);
        assert!(reply.outcome().unwrap().is_success());

        listener.stop();
        assert!(transport.receive().is_err());
    }
}
