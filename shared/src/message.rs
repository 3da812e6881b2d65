//! The platform's concrete envelope shape and its closed vocabularies.
//!
//! Every control-channel frame carries one `{id, type, data}` object, checked
//! against the [`MESSAGE`] schema. The five message kinds and the recognized
//! handshake roles are closed enums rather than free-form strings.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::{FieldType, Schema};

/// Wire shape of every control message.
pub const MESSAGE: Schema = Schema::new(&[
    ("id", FieldType::Text),
    ("type", FieldType::Text),
    ("data", FieldType::Object),
]);

/// Data keys used by the substrate itself.
pub mod keys {
    pub const RESPONDING_ID: &str = "responding_id";
    pub const RESULT: &str = "result";
    pub const PARAMS: &str = "params";
    pub const ROLE: &str = "role";
    pub const COMMAND: &str = "command";
    pub const REASON: &str = "reason";
}

/// The command a peer sends before a voluntary disconnect.
pub const EXIT_COMMAND: &str = "exit";

/// The five message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Heartbeat,
    Handshake,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Event => "event",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Handshake => "handshake",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "request" => Ok(MessageKind::Request),
            "response" => Ok(MessageKind::Response),
            "event" => Ok(MessageKind::Event),
            "heartbeat" => Ok(MessageKind::Heartbeat),
            "handshake" => Ok(MessageKind::Handshake),
            other => Err(Error::Protocol(format!("unknown message kind '{other}'"))),
        }
    }
}

/// Result field of a RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            other => Err(Error::Protocol(format!("unknown result '{other}'"))),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Roles a peer may declare in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    LobbyServer,
    DatabaseServer,
    DeveloperServer,
    Player,
    Developer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::LobbyServer => "lobby-server",
            Role::DatabaseServer => "database-server",
            Role::DeveloperServer => "developer-server",
            Role::Player => "player",
            Role::Developer => "developer",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "lobby-server" => Ok(Role::LobbyServer),
            "database-server" => Ok(Role::DatabaseServer),
            "developer-server" => Ok(Role::DeveloperServer),
            "player" => Ok(Role::Player),
            "developer" => Ok(Role::Developer),
            other => Err(Error::Protocol(format!("unrecognized role '{other}'"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed envelope: fresh random id, kind tag, kind-specific payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
        }
    }

    /// REQUEST carrying `{command, params}`.
    pub fn request(command: &str, params: Map<String, Value>) -> Self {
        let mut data = Map::new();
        data.insert(keys::COMMAND.to_owned(), Value::String(command.to_owned()));
        data.insert(keys::PARAMS.to_owned(), Value::Object(params));
        Self::new(MessageKind::Request, data)
    }

    /// RESPONSE correlating back to `responding_id`.
    pub fn response(
        responding_id: &str,
        outcome: Outcome,
        params: Option<Map<String, Value>>,
    ) -> Self {
        let mut data = Map::new();
        data.insert(
            keys::RESPONDING_ID.to_owned(),
            Value::String(responding_id.to_owned()),
        );
        data.insert(
            keys::RESULT.to_owned(),
            Value::String(outcome.as_str().to_owned()),
        );
        if let Some(params) = params {
            data.insert(keys::PARAMS.to_owned(), Value::Object(params));
        }
        Self::new(MessageKind::Response, data)
    }

    /// A failure RESPONSE whose params carry a machine-readable reason.
    pub fn failure(responding_id: &str, reason: &str) -> Self {
        let mut params = Map::new();
        params.insert(keys::REASON.to_owned(), Value::String(reason.to_owned()));
        Self::response(responding_id, Outcome::Failure, Some(params))
    }

    pub fn event(data: Map<String, Value>) -> Self {
        Self::new(MessageKind::Event, data)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, Map::new())
    }

    pub fn handshake(role: Role) -> Self {
        let mut data = Map::new();
        data.insert(
            keys::ROLE.to_owned(),
            Value::String(role.as_str().to_owned()),
        );
        Self::new(MessageKind::Handshake, data)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        MESSAGE.encode(&[
            Value::String(self.id.clone()),
            Value::String(self.kind.as_str().to_owned()),
            Value::Object(self.data.clone()),
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut values = MESSAGE.decode(bytes)?;
        // Schema order: id, type, data. Pop back to front to take ownership.
        let data = match values.pop() {
            Some(Value::Object(map)) => map,
            _ => return Err(Error::Schema("message data is not an object".to_owned())),
        };
        let kind = match values.pop() {
            Some(Value::String(tag)) => MessageKind::parse(&tag)?,
            _ => return Err(Error::Schema("message type is not text".to_owned())),
        };
        let id = match values.pop() {
            Some(Value::String(id)) => id,
            _ => return Err(Error::Schema("message id is not text".to_owned())),
        };
        Ok(Self { id, kind, data })
    }

    /// `data.responding_id` of a RESPONSE.
    pub fn responding_id(&self) -> Option<&str> {
        self.data.get(keys::RESPONDING_ID).and_then(Value::as_str)
    }

    /// `data.result` of a RESPONSE.
    pub fn outcome(&self) -> Result<Outcome> {
        let text = self
            .data
            .get(keys::RESULT)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("response carries no result".to_owned()))?;
        Outcome::parse(text)
    }

    pub fn params(&self) -> Option<&Map<String, Value>> {
        self.data.get(keys::PARAMS).and_then(Value::as_object)
    }

    /// `data.command` of a REQUEST.
    pub fn command(&self) -> Option<&str> {
        self.data.get(keys::COMMAND).and_then(Value::as_str)
    }
}

/// Read `result` out of a response payload map (`pend_and_wait` output).
pub fn outcome_of(data: &Map<String, Value>) -> Result<Outcome> {
    let text = data
        .get(keys::RESULT)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("response carries no result".to_owned()))?;
    Outcome::parse(text)
}
