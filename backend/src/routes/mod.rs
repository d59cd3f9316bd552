use axum::http::HeaderValue;
use axum::{extract::DefaultBodyLimit, routing::get, Router};
use chrono::{DateTime, NaiveDateTime, Utc};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

pub mod attachments;
pub mod health;
pub mod purchases;

/// Headroom over the upload limit for multipart boundaries and text fields.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(err) => {
                        warn!(origin = value, error = %err, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(headers))
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true)
        }
        None => CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true),
    };

    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let purchases_routes = Router::new()
        .route(
            "/",
            get(purchases::list_purchases).post(purchases::create_purchase),
        )
        .route(
            "/:id",
            get(purchases::get_purchase).delete(purchases::delete_purchase),
        );

    let attachments_routes = Router::new()
        .route("/blob/:record_id", get(attachments::download_attachment))
        .route(
            "/:owner_id",
            get(attachments::list_attachments).post(attachments::upload_attachment),
        )
        .route(
            "/:owner_id/:record_id",
            get(attachments::get_attachment)
                .patch(attachments::update_attachment)
                .delete(attachments::delete_attachment),
        );

    Router::new()
        .nest("/api/purchases", purchases_routes)
        .nest("/api/attachments", attachments_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}
