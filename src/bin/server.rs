//! `subwire` Server Binary
//!
//! Starts a `subwire` server with a small demo router on the WebSocket
//! endpoint.
//!
//! ## Usage
//!
//! ```bash
//! # Start server with default settings
//! cargo run --bin subwire-server
//!
//! # Start with custom HTTP address
//! cargo run --bin subwire-server -- --host 0.0.0.0 --port 9000
//! ```
//!
//! ## Demo procedures
//!
//! - `greeting` (query) - `{"name"?: string}` → `"hello <name>"`
//! - `sendMessage` (mutation) - `{"text": string}` → the stored message, also
//!   pushed to every `onMessage` subscriber
//! - `onMessage` (subscription) - messages sent after subscribing
//! - `onTick` (subscription) - `{"intervalMs"?: number, "count"?: number}` → 1, 2, 3, ...
//!
//! Context comes from the `user` query parameter or an `Authorization: Bearer`
//! header. Connecting with `?fail=1` makes context resolution fail.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use subwire::config::LoggingConfig;
use subwire::protocol::rest;
use subwire::protocol::{Collaborators, ConnectionInfo, ErrorEvent, Handler, ProcedureRouter, RpcError};
use subwire::Config;

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "subwire-server", version, about = "subwire WebSocket RPC server")]
struct Args {
    /// Bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file (default: config.toml + config.local.toml)
    #[arg(long)]
    config: Option<String>,
}

/// Per-connection context of the demo router
#[derive(Debug, Clone)]
struct DemoContext {
    user: String,
    remote: Option<String>,
}

async fn resolve_context(info: ConnectionInfo) -> Result<DemoContext, RpcError> {
    if info.query_param("fail").is_some() {
        return Err(RpcError::unauthorized("Context rejected by request"));
    }
    let user = info
        .query_param("user")
        .map(str::to_string)
        .or_else(|| {
            info.header("authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "anonymous".to_string());
    let remote = info
        .forwarded_for()
        .map(str::to_string)
        .or_else(|| info.remote_addr.map(|a| a.to_string()));
    Ok(DemoContext { user, remote })
}

fn demo_router() -> ProcedureRouter<DemoContext> {
    let (messages, _) = broadcast::channel::<Value>(256);
    let next_id = Arc::new(AtomicU64::new(1));
    let publisher = messages.clone();

    ProcedureRouter::new()
        .query("greeting", |ctx: Arc<DemoContext>, input| async move {
            let name = input
                .as_ref()
                .and_then(|v| v.get("name"))
                .and_then(Value::as_str)
                .map_or_else(|| ctx.user.clone(), str::to_string);
            Ok::<_, RpcError>(json!(format!("hello {name}")))
        })
        .mutation("sendMessage", move |ctx: Arc<DemoContext>, input| {
            let publisher = publisher.clone();
            let next_id = Arc::clone(&next_id);
            async move {
                let text = input
                    .as_ref()
                    .and_then(|v| v.get("text"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::bad_request("`text` is required"))?;
                let message = json!({
                    "id": next_id.fetch_add(1, Ordering::Relaxed),
                    "text": text,
                    "from": ctx.user,
                });
                // No subscribers is fine
                let _ = publisher.send(message.clone());
                Ok::<_, RpcError>(message)
            }
        })
        .subscription("onMessage", move |_ctx, _input| {
            let rx = messages.subscribe();
            Ok(stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((Ok::<_, RpcError>(message), rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }))
        })
        .subscription("onTick", |_ctx, input| {
            let interval_ms = input
                .as_ref()
                .and_then(|v| v.get("intervalMs"))
                .and_then(Value::as_u64)
                .unwrap_or(1_000);
            if interval_ms == 0 {
                return Err(RpcError::bad_request("`intervalMs` must be positive"));
            }
            let count = input
                .as_ref()
                .and_then(|v| v.get("count"))
                .and_then(Value::as_u64);
            Ok(stream::unfold(0_u64, move |n| async move {
                if count.is_some_and(|c| n >= c) {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                Some((Ok::<_, RpcError>(json!(n + 1)), n + 1))
            }))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => Config::load().context("loading configuration")?,
    };

    // Initialize tracing using config as fallback when env vars are not set
    init_tracing(&config.logging);

    // Override HTTP config from command line
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let http_config = config.http.clone();

    let router = demo_router();
    info!(procedures = ?router.paths(), "procedures_registered");

    let services = Collaborators::new(router, resolve_context).on_error(
        |event: &ErrorEvent<'_, DemoContext>| {
            tracing::warn!(
                kind = event.kind_str(),
                path = event.path.unwrap_or(""),
                user = event.ctx.map_or("", |c| c.user.as_str()),
                remote = event.ctx.and_then(|c| c.remote.as_deref()).unwrap_or(""),
                error = %event.error,
                "procedure_error"
            );
        },
    );
    let handler = Arc::new(Handler::new(config, services));

    info!(
        host = %http_config.host,
        port = http_config.port,
        path = %http_config.path,
        "subwire_server_starting"
    );

    rest::start_http_server(handler, &http_config).await?;

    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // Environment variables take precedence over config file values
    let level = env::var("SUBWIRE_LOG")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());

    // Use SUBWIRE_LOG_JSON env var if set, otherwise fall back to config.logging.format
    let json = env::var("SUBWIRE_LOG_JSON")
        .ok()
        .map_or_else(|| logging_config.format == "json", |v| v != "0");

    let log_path = env::var("SUBWIRE_LOG_FILE")
        .ok()
        .unwrap_or_else(|| logging_config.file.clone());

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if log_path.is_empty() {
        let base = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        if json {
            Box::new(base.json().finish())
        } else {
            Box::new(base.compact().finish())
        }
    } else {
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(f) => f,
            Err(e) => {
                eprintln!("ERROR: Unable to open log file '{log_path}': {e}");
                return;
            }
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let _ = TRACE_GUARD.set(guard);

        let base = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(non_blocking)
            .with_timer(tracing_subscriber::fmt::time::SystemTime);
        if json {
            Box::new(base.json().finish())
        } else {
            Box::new(base.compact().finish())
        }
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
