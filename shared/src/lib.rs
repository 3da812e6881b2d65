//! Shared messaging substrate for the lobby platform: framed transport,
//! schema-checked message envelopes, the request/response peer worker, the
//! supervised connection lifecycle, and chunked file transfer with integrity
//! manifests.

pub mod error;
pub mod framing;
pub mod integrity;
pub mod message;
pub mod schema;
pub mod session;
pub mod transfer;
pub mod worker;

pub use error::{Error, Result};
pub use framing::{ChunkHeader, FrameTransport};
pub use integrity::FileManifest;
pub use message::{Message, MessageKind, Outcome, Role};
pub use schema::{FieldType, Schema};
pub use session::{Connector, ConnectorHooks, SessionConfig};
pub use transfer::{FileReceiver, FileSender};
pub use worker::{PeerWorker, WorkerConfig, WorkerHooks};

/// Hard ceiling on the JSON payload of a single control frame.
pub const MAX_FRAME_LEN: usize = 65536;

/// Payload size of one file transfer chunk.
pub const FILE_CHUNK_SIZE: usize = 60 * 1024;
