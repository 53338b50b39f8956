//! WebSocket Handler
//!
//! Upgrades `GET {http.path}` to a WebSocket and runs one protocol session
//! over it.
//!
//! ## Protocol
//!
//! Text (or UTF-8 binary) frames carry one call object or an array of them:
//!
//! **Client → Server:**
//! - `{"id": 1, "jsonrpc": "2.0", "method": "query", "params": {"path": "greeting", "input": {"name": "a"}}}`
//! - `{"id": 2, "method": "subscription", "params": {"path": "onMessage"}}`
//! - `{"id": 2, "method": "subscription.stop"}`
//!
//! **Server → Client:**
//! - `{"id": 1, "jsonrpc": "2.0", "result": {"type": "data", "data": "hello a"}}`
//! - `{"id": 2, "result": {"type": "started"}}` then `data` frames, then `{"type": "stopped"}`
//! - `{"id": 1, "error": {"message": "...", "code": -32004, "data": {...}}}`
//! - `{"id": null, "method": "reconnect"}`
//!
//! ### Connection Lifecycle
//!
//! The connection closes when:
//! - The client sends a close frame or the socket errors
//! - No inbound traffic arrives within `session.idle_timeout_ms`
//! - `session.max_lifetime_secs` elapses
//! - The session asks for it (context resolution failed, or the outbound
//!   backlog hit the backpressure limit with `close_on_backpressure_limit` set)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Interval;
use tracing::{debug, info};

use crate::protocol::gateway::ConnectionInfo;
use crate::protocol::rest::error::RestError;
use crate::protocol::rest::WsSemaphore;
use crate::protocol::{Handler, Outbound};

/// Upgrade to a protocol WebSocket connection.
pub async fn upgrade<C: Send + Sync + 'static>(
    Extension(handler): Extension<Arc<Handler<C>>>,
    Extension(ws_sem): Extension<WsSemaphore>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, RestError> {
    // Enforce WebSocket connection limit
    let ws_permit = if let Some(ref sem) = ws_sem.0 {
        match sem.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                return Err(RestError::service_unavailable(
                    "Too many WebSocket connections",
                ));
            }
        }
    } else {
        None
    };

    let info = connection_info(&headers, query, &uri, connect_info.map(|ConnectInfo(addr)| addr));
    let max_message_size = handler.config().http.max_message_size;

    Ok(ws
        .max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| {
            // Move permit into the async block so it's held for connection lifetime
            let permit = ws_permit;
            async move {
                handle_connection(socket, handler, info).await;
                drop(permit);
            }
        }))
}

/// Collect what context resolution gets to see of the upgrade request.
pub fn connection_info(
    headers: &HeaderMap,
    query: HashMap<String, String>,
    uri: &Uri,
    remote_addr: Option<SocketAddr>,
) -> ConnectionInfo {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    ConnectionInfo {
        headers,
        query,
        url: uri.path().to_string(),
        remote_addr,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drive one connection: inbound frames into the session, the session's
/// outbound queue onto the socket, plus heartbeat and timeouts.
async fn handle_connection<C: Send + Sync + 'static>(
    socket: WebSocket,
    handler: Arc<Handler<C>>,
    info: ConnectionInfo,
) {
    let (mut sender, mut receiver) = socket.split();
    let remote_addr = info.remote_addr;

    let (outbound, mut frames) = Outbound::channel();
    let session = handler.connect(info, outbound.clone());
    let session_id = session.id();
    info!(session_id = %session_id, remote_addr = ?remote_addr, "ws_connection_start");

    let config = handler.config().session.clone();

    let idle_ms = config.idle_timeout_ms;
    let idle_duration = (idle_ms > 0).then(|| Duration::from_millis(idle_ms));
    let mut last_activity = Instant::now();

    let connection_start = Instant::now();
    let max_lifetime_secs = config.max_lifetime_secs;
    let max_lifetime = (max_lifetime_secs > 0).then(|| Duration::from_secs(max_lifetime_secs));

    let flush_limit = match config.max_backpressure {
        0 => usize::MAX,
        limit => limit,
    };

    let mut heartbeat = (config.heartbeat_interval_ms > 0).then(|| {
        let period = Duration::from_millis(config.heartbeat_interval_ms);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        let lifetime_sleep: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            match max_lifetime {
                Some(max_lt) => Box::pin(tokio::time::sleep(
                    max_lt.saturating_sub(connection_start.elapsed()),
                )),
                None => Box::pin(std::future::pending()),
            };

        // Compute remaining idle time for this iteration
        let idle_sleep: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            match idle_duration {
                Some(dur) => Box::pin(tokio::time::sleep(dur.saturating_sub(last_activity.elapsed()))),
                None => Box::pin(std::future::pending()),
            };

        tokio::select! {
            // Session output, in queue order
            frame = frames.recv() => {
                let Some(text) = frame else { break };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            // Client message
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        session.handle_frame(text.as_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_activity = Instant::now();
                        session.handle_frame(&bytes);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "ws_receive_error");
                        break;
                    }
                    // Ping/pong answered by axum; still counts as activity
                    Some(Ok(_)) => last_activity = Instant::now(),
                }
            }
            // Session asked for the transport to go away
            () = outbound.close_requested() => {
                info!(session_id = %session_id, "ws_close_requested");
                // Flush what the session queued before asking, e.g. its context
                // error, but no more than the backlog a client may fall behind
                for _ in 0..flush_limit {
                    let Some(text) = frames.try_recv() else { break };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                break;
            }
            // Server-initiated heartbeat ping
            () = tick(&mut heartbeat) => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break; // Connection dead
                }
            }
            () = idle_sleep => {
                info!(session_id = %session_id, idle_ms, "ws_idle_timeout");
                break;
            }
            () = lifetime_sleep => {
                info!(session_id = %session_id, max_lifetime_secs, "ws_max_lifetime_exceeded");
                break;
            }
        }
    }

    let cancelled = session.close();

    // Send close frame before cleanup (prevents "connection reset without handshake" warnings)
    let _ = sender.send(Message::Close(None)).await;

    info!(
        session_id = %session_id,
        cancelled_subscriptions = cancelled,
        active_sessions = handler.session_count(),
        "ws_connection_end"
    );
}
