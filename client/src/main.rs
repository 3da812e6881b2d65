use std::io::{self, BufRead};
use std::time::Duration;

use clap::Parser;
use log::info;
use serde_json::{Map, Value};

use client::Client;
use shared::message::Role;
use shared::SessionConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9000")]
    server: String,

    /// Role to declare in the handshake
    #[arg(short = 'r', long, default_value = "player")]
    role: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let role = Role::parse(&args.role)?;

    let client = Client::new(&args.server, role, SessionConfig::default());
    client.start()?;
    println!("Connecting to {} as {}.", args.server, role);
    println!("Commands: ping | send <command> [json-params] | upload <addr> <path> | exit | quit");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        // Drain anything the server pushed since the last prompt.
        while let Some(event) = client.poll_event() {
            println!("<- {} {}", event.kind.as_str(), Value::Object(event.data.clone()));
        }
        let mut words = line.trim().splitn(3, ' ');
        match words.next().unwrap_or("") {
            "" => {}
            "ping" => run_command(&client, "ping", Map::new()),
            "send" => {
                let Some(command) = words.next() else {
                    println!("usage: send <command> [json-params]");
                    continue;
                };
                let params = match words.next() {
                    Some(text) => match serde_json::from_str::<Map<String, Value>>(text) {
                        Ok(params) => params,
                        Err(e) => {
                            println!("bad params: {e}");
                            continue;
                        }
                    },
                    None => Map::new(),
                };
                run_command(&client, command, params);
            }
            "upload" => {
                let (Some(addr), Some(path)) = (words.next(), words.next()) else {
                    println!("usage: upload <addr> <path>");
                    continue;
                };
                match client.upload(addr, path, Duration::from_secs(3)) {
                    Ok((sent, manifest)) => {
                        println!("sent {sent} bytes, sha256 {}", manifest.sha256)
                    }
                    Err(e) => println!("upload failed: {e}"),
                }
            }
            "exit" => {
                client.shutdown();
                return Ok(());
            }
            "quit" => {
                client.stop();
                return Ok(());
            }
            other => println!("unknown command '{other}'"),
        }
    }

    info!("stdin closed, shutting down");
    client.shutdown();
    Ok(())
}

fn run_command(client: &Client, command: &str, params: Map<String, Value>) {
    match client.command(command, params) {
        Ok((outcome, params)) => {
            println!("{} {}", outcome.as_str(), Value::Object(params))
        }
        Err(e) => println!("request failed: {e}"),
    }
}
