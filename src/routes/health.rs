use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency: std::time::Duration) -> Self {
        Self {
            status: "ok",
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    fn error() -> Self {
        Self {
            status: "error",
            latency_ms: None,
        }
    }

    /// Backend not configured; the in-process fallback is in use.
    fn disabled() -> Self {
        Self {
            status: "disabled",
            latency_ms: None,
        }
    }

    fn is_healthy(&self) -> bool {
        self.status != "error"
    }
}

/// GET /health: dependency reachability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.db {
        Some(pool) => match db::ping(pool).await {
            Ok(latency) => ComponentHealth::ok(latency),
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                ComponentHealth::error()
            }
        },
        None => ComponentHealth::disabled(),
    };

    let redis = match &state.queue {
        Some(queue) => {
            let start = std::time::Instant::now();
            match queue.health_check().await {
                Ok(()) => ComponentHealth::ok(start.elapsed()),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis health check failed");
                    ComponentHealth::error()
                }
            }
        }
        None => ComponentHealth::disabled(),
    };

    let healthy = database.is_healthy() && redis.is_healthy();
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            checks: HealthChecks { database, redis },
        }),
    )
}
