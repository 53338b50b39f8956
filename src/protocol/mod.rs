//! `subwire` Protocol
//!
//! RPC-over-WebSocket subscription engine: wire format, session state
//! machine, broadcast channel, and the HTTP/WebSocket transport.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                      subwire Protocol                       |
//! +-------------------------------------------------------------+
//! |  HTTP Endpoints:                                            |
//! |    - /health: health check                                  |
//! |    - /stats: session and subscription counts                |
//! |    - /trpc: WebSocket (all procedure calls)                 |
//! +-------------------------------------------------------------+
//! |  Session: decode -> context -> gateway -> outbound queue    |
//! |  Broadcast: registry -> every session's outbound queue      |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Module Structure
//!
//! - `wire` - Envelope types and the frame codec
//! - `error` - Protocol error types
//! - `gateway` - Collaborator traits (procedures, context, error shaping)
//! - `router` - Map-based procedure registry
//! - `subscriptions` - Per-session subscription table
//! - `outbound` - Per-session ordered write queue
//! - `session` - Connection state machine
//! - `broadcast` - Process-wide session registry
//! - `handler` - Engine object that opens sessions
//! - `rest` - HTTP routing and the WebSocket connection loop

pub mod broadcast;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod outbound;
pub mod rest;
pub mod router;
pub mod session;
pub mod subscriptions;
pub mod wire;

// Re-export error types
pub use error::{DecodeError, DuplicateId, ErrorCode, RpcError};

// Re-export wire types
pub use wire::{
    Call, CallEnvelope, ErrorShape, JsonRpcVersion, OutboundMessage, ProcedureKind,
    ReconnectNotification, RequestId, ResponseEnvelope, ResultPayload,
};

pub use broadcast::{BroadcastReport, SessionRegistry};
pub use gateway::{
    Collaborators, ConnectionInfo, ContextResolver, DataTransformer, DefaultErrorFormatter,
    ErrorEvent, ErrorFormatter, EventStream, IdentityTransformer, ProcedureCall,
    ProcedureGateway, ProcedureOutput,
};
pub use handler::Handler;
pub use outbound::{Outbound, OutboundReceiver};
pub use router::ProcedureRouter;
pub use session::{Session, SessionState};
pub use subscriptions::{SubscriptionHandle, SubscriptionTable};

// Protocol Constants
/// Default HTTP server port
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// JSON-RPC dialect version echoed in `jsonrpc`
pub const PROTOCOL_VERSION: &str = "2.0";
