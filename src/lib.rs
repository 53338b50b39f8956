//! # subwire
//!
//! Bidirectional RPC-over-WebSocket subscription engine speaking a
//! tRPC-compatible JSON-RPC 2.0 dialect.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! WebSocket frame
//!     ↓
//! [Envelope Codec]         → ordered call envelopes (single or batch)
//!     ↓
//! [Connection Session]     → awaits the per-connection context
//!     ↓
//! [Procedure Gateway]      → value | event stream
//!     ↓
//! [Subscription Table]     → id → cancelable pump (streams only)
//!     ↓
//! [Outbound Queue]         → one ordered writer per connection
//!     ↑
//! [Broadcast Channel]      → reconnect notifications to every session
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use subwire::protocol::{Collaborators, ConnectionInfo, Handler, ProcedureRouter, RpcError};
//! use subwire::Config;
//!
//! let router = ProcedureRouter::new()
//!     .query("greeting", |_ctx, _input| async { Ok(serde_json::json!("hello")) });
//! let services = Collaborators::new(router, |_info: ConnectionInfo| async { Ok::<_, RpcError>(()) });
//!
//! let config = Config::load()?;
//! let handler = Arc::new(Handler::new(config.clone(), services));
//! subwire::protocol::rest::start_http_server(handler, &config.http).await?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `config` | Hierarchical configuration (TOML + env) |
//! | `protocol::wire` | Envelope types, decode/encode |
//! | `protocol::gateway` | Collaborator traits |
//! | `protocol::router` | Map-based procedure registry |
//! | `protocol::subscriptions` | Per-session subscription table |
//! | `protocol::outbound` | Per-session write queue |
//! | `protocol::session` | Connection state machine |
//! | `protocol::broadcast` | Session registry and reconnect fan-out |
//! | `protocol::handler` | Engine object |
//! | `protocol::rest` | axum router, WebSocket loop, graceful shutdown |

pub mod config;
pub mod protocol;

pub use config::Config;
pub use protocol::{
    Collaborators, ConnectionInfo, Handler, ProcedureKind, ProcedureRouter, RequestId, RpcError,
};
