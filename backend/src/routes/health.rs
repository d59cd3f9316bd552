use axum::{extract::State, http::StatusCode, response::Json};
use diesel::{connection::SimpleConnection, SqliteConnection};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Reports `ok` once the ledger database answers a trivial statement.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let pool = state.pool.clone();
    let check = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        let conn: &mut SqliteConnection = &mut conn;
        conn.batch_execute("SELECT 1").map_err(|err| err.to_string())
    })
    .await;

    match check {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Ok(Err(err)) => {
            warn!(error = %err, "health check could not reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
        Err(err) => {
            warn!(error = %err, "health check task failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}
