//! Health check endpoint.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::server::app::AppState;

/// GET /health — reports version and database reachability.
pub async fn health_handler(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.kernel.db_pool)
        .await
        .is_ok();

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "version": state.app_version,
            "database": if db_ok { "reachable" } else { "unreachable" },
        })),
    )
}
