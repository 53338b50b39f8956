//! `subwire` Client Binary - WebSocket RPC Client
//!
//! Command-line client that connects to a `subwire` server over WebSocket,
//! sends one call and prints every frame the server answers with.
//!
//! ## Usage
//!
//! ```bash
//! # Run a query
//! cargo run --bin subwire-client -- query greeting --input '{"name":"ada"}'
//!
//! # Run a mutation
//! cargo run --bin subwire-client -- mutation sendMessage --input '{"text":"hi"}'
//!
//! # Subscribe, stop after 3 events
//! cargo run --bin subwire-client -- subscribe onTick --input '{"intervalMs":200}' --count 3
//!
//! # Send a raw frame (single call or batch)
//! cargo run --bin subwire-client -- raw '[{"id":1,"method":"query","params":{"path":"greeting"}}]'
//! ```

use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use subwire::protocol::PROTOCOL_VERSION;

#[derive(Debug, Parser)]
#[command(name = "subwire-client", version, about = "subwire WebSocket RPC client")]
struct Args {
    /// WebSocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:8080/trpc")]
    url: String,

    /// Give up waiting for frames after this many milliseconds of silence
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a query procedure
    Query {
        path: String,
        #[arg(long)]
        input: Option<String>,
    },
    /// Call a mutation procedure
    Mutation {
        path: String,
        #[arg(long)]
        input: Option<String>,
    },
    /// Open a subscription and print its events
    Subscribe {
        path: String,
        #[arg(long)]
        input: Option<String>,
        /// Send `subscription.stop` after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send a raw JSON frame
    Raw { frame: String },
}

const CALL_ID: i64 = 1;

fn parse_input(input: Option<&str>) -> anyhow::Result<Option<Value>> {
    input
        .map(|s| serde_json::from_str(s).with_context(|| format!("invalid --input JSON: {s}")))
        .transpose()
}

fn call_frame(method: &str, path: &str, input: Option<Value>) -> Value {
    let mut params = json!({ "path": path });
    if let Some(input) = input {
        params["input"] = input;
    }
    json!({
        "id": CALL_ID,
        "jsonrpc": PROTOCOL_VERSION,
        "method": method,
        "params": params,
    })
}

/// Whether a frame ends the call identified by `CALL_ID`.
fn is_terminal(frame: &Value, subscribing: bool) -> bool {
    if frame.get("id") != Some(&json!(CALL_ID)) {
        return false;
    }
    if frame.get("error").is_some() {
        return true;
    }
    match frame.pointer("/result/type").and_then(Value::as_str) {
        Some("stopped") => true,
        Some("data") => !subscribing,
        _ => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (frame, subscribing, stop_after) = match &args.command {
        Command::Query { path, input } => (
            call_frame("query", path, parse_input(input.as_deref())?),
            false,
            None,
        ),
        Command::Mutation { path, input } => (
            call_frame("mutation", path, parse_input(input.as_deref())?),
            false,
            None,
        ),
        Command::Subscribe { path, input, count } => (
            call_frame("subscription", path, parse_input(input.as_deref())?),
            true,
            *count,
        ),
        Command::Raw { frame } => (
            serde_json::from_str(frame).context("raw frame is not JSON")?,
            false,
            None,
        ),
    };

    let (mut socket, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    eprintln!("connected to {}", args.url);

    socket.send(Message::Text(frame.to_string())).await?;

    let silence = Duration::from_millis(args.timeout_ms);
    let mut events = 0_usize;

    loop {
        let next = match tokio::time::timeout(silence, socket.next()).await {
            Ok(next) => next,
            Err(_) => {
                eprintln!("no frame for {}ms, giving up", args.timeout_ms);
                break;
            }
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                eprintln!("server closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => bail!("receive failed: {e}"),
        };

        println!("{text}");
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        if is_terminal(&value, subscribing) {
            break;
        }
        if subscribing && value.pointer("/result/type").and_then(Value::as_str) == Some("data") {
            events += 1;
            if stop_after.is_some_and(|n| events >= n) {
                let stop = json!({"id": CALL_ID, "jsonrpc": PROTOCOL_VERSION, "method": "subscription.stop"});
                socket.send(Message::Text(stop.to_string())).await?;
            }
        }
    }

    let _ = socket.close(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame_shape() {
        let frame = call_frame("query", "greeting", Some(json!({"name": "ada"})));
        assert_eq!(
            frame,
            json!({"id": 1, "jsonrpc": "2.0", "method": "query",
                   "params": {"path": "greeting", "input": {"name": "ada"}}})
        );
        let frame = call_frame("subscription", "onTick", None);
        assert!(frame["params"].get("input").is_none());
    }

    #[test]
    fn test_terminal_detection() {
        let data = json!({"id": 1, "result": {"type": "data", "data": 1}});
        assert!(is_terminal(&data, false));
        assert!(!is_terminal(&data, true));
        assert!(is_terminal(&json!({"id": 1, "result": {"type": "stopped"}}), true));
        assert!(is_terminal(&json!({"id": 1, "error": {"message": "x"}}), true));
        assert!(!is_terminal(&json!({"id": null, "method": "reconnect"}), true));
    }
}
