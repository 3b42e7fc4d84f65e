//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealthResponse,
    pub pending_updates: PendingUpdateStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct StoreHealthResponse {
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub dispatch: DispatchStats,
    pub pending_updates: PendingUpdateStats,
}

#[derive(Debug, Serialize)]
pub struct DispatchStats {
    pub method: String,
    pub notifiers: usize,
    pub lease_count: usize,
    pub max_send_attempts: u32,
}

/// Results held in the manager's buffers, not yet written to the store.
#[derive(Debug, Serialize)]
pub struct PendingUpdateStats {
    pub success: usize,
    pub failure: usize,
}

#[tracing::instrument(skip_all)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (success, failure) = state.manager.buffered_updates();
    let postgres = state.postgres_pool.as_ref().map(|pool| {
        let inner = pool.pool();
        PostgresHealthResponse {
            pool_size: inner.size(),
            idle_connections: inner.num_idle() as u32,
        }
    });

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store: StoreHealthResponse {
            backend: state.store.backend_type().to_string(),
        },
        pending_updates: PendingUpdateStats { success, failure },
        postgres,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let config = &state.settings.notifications;
    let (success, failure) = state.manager.buffered_updates();

    Json(StatsResponse {
        dispatch: DispatchStats {
            method: config.method.to_string(),
            notifiers: config.notifiers,
            lease_count: config.lease_count,
            max_send_attempts: config.max_send_attempts,
        },
        pending_updates: PendingUpdateStats { success, failure },
    })
}
