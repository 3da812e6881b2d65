use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use serde_json::{Map, Value};

use server::handler::{serve_requests, CommandResult, Connection, RoleHandler, ServeOptions};
use server::{Gateway, Listener, ListenerConfig};
use shared::message::{keys, outcome_of, Role};
use shared::{ConnectorHooks, SessionConfig};

/// Lobby server: accepts players and developers, forwards database commands
/// upstream when an upstream address is given.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "9000")]
    port: u16,
    /// Database server address to forward to (host:port)
    #[clap(short, long)]
    upstream: Option<String>,
}

/// Serves players: answers pings and echoes, forwards everything else to the
/// upstream gateway when one is configured.
struct PlayerHandler {
    gateway: Option<Arc<Gateway>>,
}

impl RoleHandler for PlayerHandler {
    fn handle(&self, conn: Connection) {
        let gateway = self.gateway.clone();
        let commands = move |command: &str, params: &Map<String, Value>| -> CommandResult {
            match command {
                "ping" => Ok(Map::new()),
                "echo" => Ok(params.clone()),
                other => match &gateway {
                    Some(gateway) => relay(gateway.forward(other, params.clone())),
                    None => Err(format!("unknown command '{}'", other)),
                },
            }
        };
        serve_requests(&conn, &commands, ServeOptions::default());
    }
}

/// Turn an upstream response back into a command result for the local loop.
fn relay(response: Map<String, Value>) -> CommandResult {
    let params = response
        .get(keys::PARAMS)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    match outcome_of(&response) {
        Ok(outcome) if outcome.is_success() => Ok(params),
        _ => Err(params
            .get(keys::REASON)
            .and_then(Value::as_str)
            .unwrap_or("upstream failure")
            .to_owned()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let gateway = match &args.upstream {
        Some(addr) => {
            let gateway = Arc::new(Gateway::new(
                addr,
                Role::LobbyServer,
                SessionConfig::default(),
                ConnectorHooks {
                    on_connected: Some(Arc::new(|| info!("upstream connected"))),
                    on_connection_lost: Some(Arc::new(|| warn!("upstream connection lost"))),
                    ..ConnectorHooks::default()
                },
            ));
            gateway.start()?;
            Some(gateway)
        }
        None => None,
    };

    let mut handlers: HashMap<Role, Arc<dyn RoleHandler>> = HashMap::new();
    handlers.insert(
        Role::Player,
        Arc::new(PlayerHandler {
            gateway: gateway.clone(),
        }),
    );
    handlers.insert(
        Role::Developer,
        Arc::new(PlayerHandler {
            gateway: gateway.clone(),
        }),
    );

    let address = format!("{}:{}", args.host, args.port);
    let listener = Listener::bind(&address, handlers, ListenerConfig::default())?;
    listener.start()?;
    println!("Lobby server running on {address}. Type 'stop' to shut down.");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "stop" => break,
            "status" => {
                println!("active connections: {}", listener.active_connections());
                if let Some(gateway) = &gateway {
                    println!(
                        "upstream: {}",
                        if gateway.is_connected() { "connected" } else { "down" }
                    );
                }
            }
            "" => {}
            other => println!("unknown command '{}' (try 'stop' or 'status')", other),
        }
    }

    info!("shutting down");
    listener.stop();
    if let Some(gateway) = gateway {
        gateway.stop();
    }
    Ok(())
}
