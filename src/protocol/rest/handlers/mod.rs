//! HTTP Handlers
//!
//! - `admin` - health and statistics
//! - `ws` - WebSocket upgrade and the per-connection loop

pub mod admin;
pub mod ws;
