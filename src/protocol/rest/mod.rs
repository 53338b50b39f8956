//! HTTP Module
//!
//! Provides the HTTP server with the WebSocket protocol endpoint and the
//! health/stats endpoints. All procedure calls go through the WebSocket
//! endpoint (`http.path`, `/trpc` by default).

pub mod dto;
pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::HttpConfig;
use crate::protocol::Handler;

use self::handlers::{admin, ws};

/// How long shutdown waits for open sessions to disconnect.
const SHUTDOWN_DRAIN: std::time::Duration = std::time::Duration::from_secs(5);

/// Caps concurrent WebSocket connections (`None` = unlimited).
#[derive(Clone)]
pub struct WsSemaphore(pub Option<Arc<Semaphore>>);

/// Error type of the server entry points
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid bind address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn cors_layer(config: &HttpConfig) -> Option<CorsLayer> {
    if !config.cors_origins.is_empty() {
        // Explicit origins configured: restrict to those
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|s| {
                let parsed = s.parse();
                if parsed.is_err() {
                    warn!(origin = %s, "invalid_cors_origin_ignored");
                }
                parsed.ok()
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else if config.cors_allow_all {
        // Explicit dev mode opt-in: allow all origins
        Some(CorsLayer::permissive())
    } else {
        // Default: same-origin only (no CORS layer = Axum denies cross-origin)
        None
    }
}

/// Creates the Axum router
pub fn create_router<C: Send + Sync + 'static>(handler: Arc<Handler<C>>, config: &HttpConfig) -> Router {
    let ws_sem = WsSemaphore(
        (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections))),
    );

    let ws_path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };

    // Extension must be the OUTER layer (applied last) so handlers can extract it.
    let mut app = Router::new()
        .route("/health", get(admin::health::<C>))
        .route("/stats", get(admin::stats::<C>))
        .route(&ws_path, get(ws::upgrade::<C>))
        .layer(Extension(ws_sem))
        .layer(Extension(handler));

    if let Some(cors) = cors_layer(config) {
        app = app.layer(cors);
    }

    app
}

/// Starts the HTTP server with graceful shutdown support.
///
/// Listens for SIGINT (ctrl-c) and SIGTERM to trigger graceful shutdown.
/// On shutdown, every connected client is told to reconnect (when
/// `session.broadcast_reconnect_on_shutdown` is set) before the listener
/// stops.
pub async fn start_http_server<C: Send + Sync + 'static>(
    handler: Arc<Handler<C>>,
    config: &HttpConfig,
) -> Result<(), ServerError> {
    let addr_str = format!("{}:{}", config.host, config.port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|source| ServerError::InvalidAddress {
            addr: addr_str.clone(),
            source,
        })?;

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;

    info!(addr = %addr, path = %config.path, "http_server_listening");
    serve(listener, handler, config, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<C, F>(
    listener: tokio::net::TcpListener,
    handler: Arc<Handler<C>>,
    config: &HttpConfig,
    shutdown: F,
) -> Result<(), ServerError>
where
    C: Send + Sync + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(Arc::clone(&handler), config);
    let broadcast_on_shutdown = handler.config().session.broadcast_reconnect_on_shutdown;
    let shutdown_handler = Arc::clone(&handler);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        if broadcast_on_shutdown {
            let report = shutdown_handler.broadcast_reconnect_notification();
            info!(delivered = report.delivered, "shutdown_reconnect_broadcast");
        }
    })
    .await?;

    // Upgraded sockets outlive the listener; give clients a moment to act on
    // the reconnect notification and hang up.
    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
    while handler.session_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    info!(remaining_sessions = handler.session_count(), "http_server_stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown_signal_received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Collaborators, ConnectionInfo, ProcedureRouter, RpcError};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn make_handler() -> Arc<Handler<()>> {
        let services = Collaborators::new(ProcedureRouter::new(), |_info: ConnectionInfo| async {
            Ok::<_, RpcError>(())
        });
        Arc::new(Handler::new(crate::Config::default(), services))
    }

    #[tokio::test]
    async fn test_router_health_does_not_500() {
        let app = create_router(make_handler(), &HttpConfig::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "Health must return 200, not 500");
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_path_is_rejected() {
        let app = create_router(make_handler(), &HttpConfig::default());
        let req = Request::builder().uri("/trpc").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_path_without_leading_slash() {
        let config = HttpConfig {
            path: "rpc".to_string(),
            ..HttpConfig::default()
        };
        let app = create_router(make_handler(), &config);
        let req = Request::builder().uri("/rpc").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_cors_layer_selection() {
        assert!(cors_layer(&HttpConfig::default()).is_none());
        let allow_all = HttpConfig {
            cors_allow_all: true,
            ..HttpConfig::default()
        };
        assert!(cors_layer(&allow_all).is_some());
        let explicit = HttpConfig {
            cors_origins: vec!["http://localhost:3000".to_string()],
            ..HttpConfig::default()
        };
        assert!(cors_layer(&explicit).is_some());
    }
}
