//! Peer worker: the per-connection request/response correlation engine.
//!
//! One worker owns one frame transport and three long-lived threads: a
//! dispatch loop sending pending requests, a receive loop demultiplexing
//! inbound messages, and an optional heartbeat loop probing liveness. Any
//! thread may call [`PeerWorker::pend_and_wait`]; responses are matched to
//! waiters by id, so arrival order never matters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::framing::FrameTransport;
use crate::message::{outcome_of, Message, MessageKind};

/// Cadence of the dispatch loop's pending-table scan.
const DISPATCH_TICK: Duration = Duration::from_millis(100);
/// Cadence of the heartbeat loop's due-time check.
const HEARTBEAT_POLL: Duration = Duration::from_millis(100);

pub type MessageHook = Arc<dyn Fn(Message) + Send + Sync>;
pub type LossHook = Arc<dyn Fn() + Send + Sync>;
pub type HeartbeatFn = Arc<dyn Fn() -> (MessageKind, Map<String, Value>) + Send + Sync>;

/// Callbacks shared with a worker. `Arc`'d so a connection lifecycle can hand
/// the same hooks to every worker it creates across reconnects.
#[derive(Default, Clone)]
pub struct WorkerHooks {
    /// Invoked with every non-response message. Unsolicited messages are
    /// logged and dropped when absent.
    pub on_message: Option<MessageHook>,
    /// Invoked at most once per worker, by whichever loop first detects loss.
    pub on_connection_lost: Option<LossHook>,
    /// Heartbeat message factory. The heartbeat loop only runs when present.
    pub make_heartbeat: Option<HeartbeatFn>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Read timeout applied to the transport; bounds how long the receive
    /// loop can park in a blocking read.
    pub receive_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures tolerated before declaring loss.
    pub heartbeat_patience: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_patience: 3,
        }
    }
}

struct PendingEntry {
    kind: MessageKind,
    data: Map<String, Value>,
    sent: bool,
    response: Option<Map<String, Value>>,
}

struct Inner {
    transport: FrameTransport,
    config: WorkerConfig,
    hooks: WorkerHooks,
    pending: Mutex<HashMap<String, PendingEntry>>,
    wakeup: Condvar,
    stop: AtomicBool,
    lost: AtomicBool,
}

pub struct PeerWorker {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerWorker {
    pub fn new(transport: FrameTransport, config: WorkerConfig, hooks: WorkerHooks) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                hooks,
                pending: Mutex::new(HashMap::new()),
                wakeup: Condvar::new(),
                stop: AtomicBool::new(false),
                lost: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatch, receive and (if configured) heartbeat threads.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        self.inner
            .transport
            .set_read_timeout(self.inner.config.receive_timeout)?;

        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name("peer-receive".to_owned())
                .spawn(move || inner.receive_loop())?,
        );
        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name("peer-dispatch".to_owned())
                .spawn(move || inner.dispatch_loop())?,
        );
        if self.inner.hooks.make_heartbeat.is_some() {
            let inner = Arc::clone(&self.inner);
            threads.push(
                thread::Builder::new()
                    .name("peer-heartbeat".to_owned())
                    .spawn(move || inner.heartbeat_loop())?,
            );
        }
        Ok(())
    }

    /// Queue a request and block until its correlated response arrives.
    ///
    /// Exactly four outcomes: the response data, [`Error::Timeout`],
    /// [`Error::ConnectionLost`], or [`Error::Stopped`]. `None` means no
    /// deadline; the call still terminates on stop or loss.
    pub fn pend_and_wait(
        &self,
        kind: MessageKind,
        data: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Map<String, Value>> {
        self.inner.pend_and_wait(kind, data, timeout)
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Stop the worker: close the transport to unblock the receive loop, wake
    /// every waiter, join all loops, clear the pending table. Idempotent.
    /// Must not be called from inside a worker hook.
    pub fn stop(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.transport.close();
        self.inner.wakeup.notify_all();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        self.inner.pending.lock().clear();
        self.inner.wakeup.notify_all();
        debug!("worker stopped");
    }
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.lost.load(Ordering::SeqCst)
    }

    /// Flip the loss flag; only the winner notifies and runs the callback, so
    /// the callback fires at most once per worker even when several loops
    /// detect the failure.
    fn mark_lost(&self) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        if self
            .lost
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("connection lost");
            self.wakeup.notify_all();
            if let Some(on_lost) = &self.hooks.on_connection_lost {
                on_lost();
            }
        }
    }

    fn pend_and_wait(
        &self,
        kind: MessageKind,
        data: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Map<String, Value>> {
        let id = Uuid::new_v4().to_string();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut pending = self.pending.lock();
        pending.insert(
            id.clone(),
            PendingEntry {
                kind,
                data,
                sent: false,
                response: None,
            },
        );
        loop {
            if self.stop.load(Ordering::SeqCst) {
                pending.remove(&id);
                return Err(Error::Stopped);
            }
            if self.lost.load(Ordering::SeqCst) {
                pending.remove(&id);
                return Err(Error::ConnectionLost);
            }
            match pending.get(&id) {
                Some(entry) if entry.response.is_some() => {
                    let entry = pending.remove(&id);
                    return Ok(entry.and_then(|e| e.response).unwrap_or_default());
                }
                Some(_) => {}
                None => return Err(Error::Stopped),
            }
            let timed_out = match deadline {
                Some(at) => self.wakeup.wait_until(&mut pending, at).timed_out(),
                None => {
                    self.wakeup.wait(&mut pending);
                    false
                }
            };
            if timed_out {
                // A response may have landed right at the deadline.
                return match pending.remove(&id).and_then(|e| e.response) {
                    Some(response) => Ok(response),
                    None => Err(Error::Timeout),
                };
            }
        }
    }

    /// Scan the pending table each tick and send every entry not yet sent.
    /// The lock is released around the socket call.
    fn dispatch_loop(&self) {
        debug!("dispatch loop entered");
        while !self.halted() {
            let unsent: Vec<(String, MessageKind, Map<String, Value>)> = {
                let pending = self.pending.lock();
                pending
                    .iter()
                    .filter(|(_, entry)| !entry.sent)
                    .map(|(id, entry)| (id.clone(), entry.kind, entry.data.clone()))
                    .collect()
            };
            for (id, kind, data) in unsent {
                let message = Message {
                    id: id.clone(),
                    kind,
                    data,
                };
                let outcome = message.encode().and_then(|bytes| self.transport.send(&bytes));
                match outcome {
                    Ok(()) => {
                        if let Some(entry) = self.pending.lock().get_mut(&id) {
                            entry.sent = true;
                        }
                    }
                    Err(e) => {
                        warn!("sending request {}: {}", id, e);
                        self.mark_lost();
                        break;
                    }
                }
            }
            thread::sleep(DISPATCH_TICK);
        }
        debug!("dispatch loop exited");
    }

    fn receive_loop(&self) {
        debug!("receive loop entered");
        while !self.halted() {
            match self.transport.receive() {
                Ok(bytes) => match Message::decode(&bytes) {
                    Ok(message) => self.route(message),
                    Err(e) => {
                        warn!("undecodable frame: {}", e);
                        self.mark_lost();
                    }
                },
                Err(Error::Timeout) => continue,
                Err(e) => {
                    if !self.halted() {
                        warn!("receive failed: {}", e);
                        self.mark_lost();
                    }
                }
            }
        }
        debug!("receive loop exited");
    }

    fn route(&self, message: Message) {
        if message.kind == MessageKind::Response {
            let Some(responding_id) = message.responding_id().map(str::to_owned) else {
                warn!("response {} carries no responding_id", message.id);
                return;
            };
            let mut pending = self.pending.lock();
            match pending.get_mut(&responding_id) {
                Some(entry) => {
                    entry.response = Some(message.data);
                    drop(pending);
                    self.wakeup.notify_all();
                }
                // The waiter may already have timed out and left.
                None => warn!("response for unknown request {}", responding_id),
            }
        } else if let Some(on_message) = &self.hooks.on_message {
            on_message(message);
        } else {
            debug!(
                "dropping unsolicited {} message {}",
                message.kind.as_str(),
                message.id
            );
        }
    }

    /// Probe the peer on a fixed interval through the same pending table as
    /// ordinary requests. Consecutive failures up to the configured patience
    /// declare the connection lost.
    fn heartbeat_loop(&self) {
        let Some(make_heartbeat) = self.hooks.make_heartbeat.clone() else {
            return;
        };
        debug!("heartbeat loop entered");
        let interval = self.config.heartbeat_interval;
        let mut failures = 0u32;
        let mut due = Instant::now() + interval;
        while !self.halted() {
            thread::sleep(HEARTBEAT_POLL);
            if Instant::now() < due {
                continue;
            }
            due = Instant::now() + interval;
            let (kind, data) = make_heartbeat();
            match self.pend_and_wait(kind, data, Some(interval / 2)) {
                Ok(response) => match outcome_of(&response) {
                    Ok(outcome) if outcome.is_success() => failures = 0,
                    _ => {
                        warn!("heartbeat answered without success");
                        failures += 1;
                    }
                },
                Err(Error::Timeout) => {
                    warn!("heartbeat timed out");
                    failures += 1;
                }
                Err(_) => break,
            }
            if failures >= self.config.heartbeat_patience {
                warn!("{} consecutive heartbeat failures", failures);
                self.mark_lost();
            }
        }
        debug!("heartbeat loop exited");
    }
}
