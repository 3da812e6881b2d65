//! # Lobby Client Library
//!
//! A headless consumer of the messaging substrate: wraps the outbound
//! connection lifecycle, queues unsolicited messages for the caller, and
//! uploads files over dedicated short-lived sockets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{info, warn};
use serde_json::{Map, Value};

use shared::error::Result;
use shared::integrity::FileManifest;
use shared::message::{keys, outcome_of, Message, Outcome, Role};
use shared::{Connector, ConnectorHooks, FileSender, FrameTransport, SessionConfig};

/// One platform connection plus a queue of messages the server pushed
/// without being asked (events, server-initiated requests).
pub struct Client {
    connector: Connector,
    events: Receiver<Message>,
}

impl Client {
    /// Build a client for `addr` declaring `role`. Call [`Client::start`] to
    /// actually connect.
    pub fn new(addr: &str, role: Role, config: SessionConfig) -> Self {
        let (sender, events) = crossbeam_channel::unbounded();
        let push: Sender<Message> = sender;
        let connector = Connector::new(
            addr,
            role,
            config,
            ConnectorHooks {
                on_connected: Some(Arc::new(|| info!("session established"))),
                on_connection_lost: Some(Arc::new(|| warn!("connection lost"))),
                on_message: Some(Arc::new(move |message: Message| {
                    if push.send(message).is_err() {
                        warn!("event queue receiver dropped");
                    }
                })),
                ..ConnectorHooks::default()
            },
        );
        Self { connector, events }
    }

    pub fn start(&self) -> Result<()> {
        self.connector.start()
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Send `{command, params}` and split the response into its outcome and
    /// params.
    pub fn command(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<(Outcome, Map<String, Value>)> {
        let response = self.connector.command(command, params)?;
        let outcome = outcome_of(&response)?;
        let params = response
            .get(keys::PARAMS)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok((outcome, params))
    }

    /// Pop one queued unsolicited message, if any.
    pub fn poll_event(&self) -> Option<Message> {
        match self.events.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// The unsolicited-message queue, for callers that want to block on it.
    pub fn events(&self) -> &Receiver<Message> {
        &self.events
    }

    /// Stream `path` to a transfer endpoint over its own socket, returning
    /// the bytes sent and a manifest the receiver can verify against. The
    /// control session is not involved.
    pub fn upload(
        &self,
        addr: &str,
        path: impl AsRef<Path>,
        connect_timeout: Duration,
    ) -> Result<(u64, FileManifest)> {
        let path = path.as_ref();
        let manifest = FileManifest::for_file(path)?;
        let transport = FrameTransport::connect(addr, connect_timeout)?;
        let sender = FileSender::new(transport, path);
        let result = sender.send();
        sender.close();
        let sent = result?;
        info!("uploaded {} ({} bytes)", path.display(), sent);
        Ok((sent, manifest))
    }

    /// Tell the server we are leaving, then tear the session down.
    pub fn shutdown(&self) {
        self.connector.announce_exit();
        self.connector.stop();
    }

    /// Tear the session down without the exit courtesy.
    pub fn stop(&self) {
        self.connector.stop();
    }
}
