//! Admin Handlers
//!
//! Health check and statistics endpoints.

use std::sync::Arc;

use axum::{Extension, Json};

use crate::protocol::rest::dto::{ApiResponse, HealthDto, StatsDto};
use crate::protocol::Handler;

/// Health check endpoint
pub async fn health<C: Send + Sync + 'static>(
    Extension(handler): Extension<Arc<Handler<C>>>,
) -> Json<ApiResponse<HealthDto>> {
    let health = HealthDto {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: handler.uptime_seconds(),
    };

    Json(ApiResponse::success(health))
}

/// Session and subscription counts
pub async fn stats<C: Send + Sync + 'static>(
    Extension(handler): Extension<Arc<Handler<C>>>,
) -> Json<ApiResponse<StatsDto>> {
    let stats = StatsDto {
        sessions: handler.session_count(),
        subscriptions: handler.subscription_count(),
        uptime_secs: handler.uptime_seconds(),
    };

    Json(ApiResponse::success(stats))
}
