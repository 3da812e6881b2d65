//! Upstream gateway: the server's own outbound leg to the database server,
//! kept alive with unbounded reconnects.

use serde_json::{Map, Value};

use log::warn;
use shared::error::Error;
use shared::message::{keys, Outcome, Role};
use shared::{Connector, ConnectorHooks, Result, SessionConfig};

/// Forwards commands upstream and shapes transport failures into ordinary
/// failure responses, so request handlers can relay them to clients without
/// special cases.
pub struct Gateway {
    connector: Connector,
}

impl Gateway {
    /// A gateway never gives up on its upstream; connect attempts are
    /// unbounded regardless of what `config` says.
    pub fn new(addr: &str, role: Role, mut config: SessionConfig, hooks: ConnectorHooks) -> Self {
        config.max_connect_attempts = None;
        Self {
            connector: Connector::new(addr, role, config, hooks),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.connector.start()
    }

    pub fn stop(&self) {
        self.connector.announce_exit();
        self.connector.stop();
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Forward `{command, params}` upstream. The returned map is always a
    /// response-shaped `{result, params?}`; timeouts and outages become
    /// failures with a `reason` param instead of errors.
    pub fn forward(&self, command: &str, params: Map<String, Value>) -> Map<String, Value> {
        match self.connector.command(command, params) {
            Ok(response) => response,
            Err(Error::Timeout) => {
                warn!("upstream did not answer '{}' in time", command);
                failure_data("upstream timeout")
            }
            Err(Error::ConnectionLost) | Err(Error::Stopped) => {
                warn!("upstream unavailable for '{}'", command);
                failure_data("upstream unavailable")
            }
            Err(e) => {
                warn!("forwarding '{}' failed: {}", command, e);
                failure_data("upstream error")
            }
        }
    }
}

fn failure_data(reason: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert(keys::REASON.to_owned(), Value::String(reason.to_owned()));
    let mut data = Map::new();
    data.insert(
        keys::RESULT.to_owned(),
        Value::String(Outcome::Failure.as_str().to_owned()),
    );
    data.insert(keys::PARAMS.to_owned(), Value::Object(params));
    data
}
