//! # Lobby Server Library
//!
//! The inbound half of the platform's messaging substrate: a TCP listener
//! that gates every connection through a role handshake, per-role connection
//! handlers, and the request-serving loop they run.
//!
//! ## Connection lifecycle
//!
//! Each accepted socket must open with a HANDSHAKE frame declaring one of the
//! platform roles. The listener accepts it only when the role parses and a
//! handler is registered for it; otherwise the peer receives a failure
//! response carrying the reason and the socket is closed. Accepted
//! connections run on their own thread until the peer exits, goes silent past
//! the heartbeat timeout, or the socket drops.
//!
//! ## Module organization
//!
//! - [`listener`]: bind, non-blocking accept loop, handshake acceptance,
//!   live-connection tracking for shutdown.
//! - [`handler`]: the [`handler::RoleHandler`] registry seam and
//!   [`handler::serve_requests`], the heartbeat/command/EXIT responder loop.
//! - [`gateway`]: the server's own outbound leg to an upstream (database)
//!   server, with unbounded reconnects and failure-shaped error translation.

pub mod gateway;
pub mod handler;
pub mod listener;

pub use gateway::Gateway;
pub use handler::{serve_requests, CommandHandler, Connection, RoleHandler, ServeOptions};
pub use listener::{Listener, ListenerConfig};
