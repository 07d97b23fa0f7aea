#![forbid(unsafe_code)]

//! `agent-runner-ctl` — local CLI companion for `agent-runner`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.
//! Used by non-streaming callers to create and terminate sessions with
//! the same validation rules as the coordinator command path.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "agent-runner-ctl",
    about = "Local CLI for the agent-runner server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "agent-runner")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List live sessions.
    List,

    /// Show runner state and uptime.
    Status,

    /// Start a session from a JSON config file.
    Start {
        /// Path to a JSON file holding the session config.
        config: PathBuf,
    },

    /// Stop a session.
    Stop {
        /// Session identifier.
        id: String,
        /// Terminate immediately instead of winding down.
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match &args.command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Status => serde_json::json!({ "command": "status" }),
        Command::Start { config } => {
            let raw = match std::fs::read_to_string(config) {
                Ok(raw) => raw,
                Err(err) => {
                    eprintln!("Cannot read config file: {err}");
                    std::process::exit(1);
                }
            };
            let parsed: serde_json::Value = match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    eprintln!("Config file is not valid JSON: {err}");
                    std::process::exit(1);
                }
            };
            serde_json::json!({ "command": "start", "config": parsed })
        }
        Command::Stop { id, force } => {
            serde_json::json!({ "command": "stop", "id": id, "graceful": !force })
        }
    };

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!(
                "Is agent-runner running with ipc_name '{}'?",
                args.ipc_name
            );
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    // Send request as a single JSON line.
    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    // Read response line.
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    Ok(serde_json::from_str(&response_line)?)
}
