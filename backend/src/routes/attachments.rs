use axum::body::Body;
use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use super::purchases::purchase_exists;
use super::to_iso;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::{AttachRequest, AttachmentCategory, AttachmentRecord};

const INLINE_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
];

#[derive(Serialize)]
pub struct AttachmentResponse {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub category: AttachmentCategory,
    pub media_type: String,
    pub byte_size: i64,
    pub content_hash: String,
    pub reference_count: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl From<AttachmentRecord> for AttachmentResponse {
    fn from(record: AttachmentRecord) -> Self {
        Self {
            id: record.id,
            purchase_id: record.owner_id,
            original_name: record.original_name,
            stored_name: record.stored_name,
            category: record.category,
            media_type: record.media_type,
            byte_size: record.byte_size,
            content_hash: record.content_hash,
            reference_count: record.reference_count,
            created_at: to_iso(record.created_at),
            updated_at: record.updated_at.map(to_iso),
        }
    }
}

#[derive(Deserialize)]
pub struct AttachmentListQuery {
    pub category: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateAttachmentRequest {
    pub category: String,
}

async fn ensure_owner(state: &AppState, owner_id: Uuid) -> AppResult<()> {
    let pool = state.pool.clone();
    let exists = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))?;
        purchase_exists(&mut conn, owner_id).map_err(AppError::from)
    })
    .await??;

    if exists {
        Ok(())
    } else {
        Err(AppError::not_found())
    }
}

/// Loads a record and insists it belongs to `owner_id`.
async fn owned_record(
    state: &AppState,
    owner_id: Uuid,
    record_id: Uuid,
) -> AppResult<AttachmentRecord> {
    ensure_owner(state, owner_id).await?;
    let record = state.store.fetch(record_id).await?;
    if record.owner_id != owner_id {
        return Err(AppError::not_found());
    }
    Ok(record)
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<AttachmentResponse>)> {
    ensure_owner(&state, owner_id).await?;

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut media_type: Option<String> = None;
    let mut category: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::new(err.status(), format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                original_name = field.file_name().map(|n| n.to_string());
                media_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::new(err.status(), format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("category") | Some("file_type") => {
                let value = field.text().await.map_err(|err| {
                    error!(error = %err, "invalid category field");
                    AppError::new(err.status(), format!("invalid category: {err}"))
                })?;
                category = Some(value);
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| {
        error!("upload rejected: missing file field");
        AppError::bad_request("file field is required")
    })?;
    let category: AttachmentCategory = category
        .ok_or_else(|| AppError::bad_request("category is required"))?
        .parse()?;
    let original_name = original_name.unwrap_or_default();
    let name_for_log = original_name.clone();

    let outcome = match state
        .store
        .attach(AttachRequest {
            owner_id,
            bytes,
            original_name,
            category,
            media_type,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, purchase_id = %owner_id, original_name = %name_for_log, "attachment upload failed");
            return Err(err.into());
        }
    };

    info!(
        attachment_id = %outcome.record.id,
        purchase_id = %owner_id,
        created = outcome.created,
        reference_count = outcome.record.reference_count,
        "attachment upload succeeded"
    );
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.record.into())))
}

pub async fn list_attachments(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Query(query): Query<AttachmentListQuery>,
) -> AppResult<Json<Vec<AttachmentResponse>>> {
    let category = query
        .category
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::parse::<AttachmentCategory>)
        .transpose()?;
    ensure_owner(&state, owner_id).await?;

    let records = state.store.list_for_owner(owner_id, category).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

pub async fn get_attachment(
    State(state): State<AppState>,
    Path((owner_id, record_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<AttachmentResponse>> {
    let record = owned_record(&state, owner_id, record_id).await?;
    Ok(Json(record.into()))
}

pub async fn update_attachment(
    State(state): State<AppState>,
    Path((owner_id, record_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateAttachmentRequest>,
) -> AppResult<Json<AttachmentResponse>> {
    let category: AttachmentCategory = payload.category.parse()?;
    owned_record(&state, owner_id, record_id).await?;
    let record = state.store.recategorize(record_id, category).await?;
    Ok(Json(record.into()))
}

pub async fn delete_attachment(
    State(state): State<AppState>,
    Path((owner_id, record_id)): Path<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    owned_record(&state, owner_id, record_id).await?;
    let outcome = state.store.detach(record_id).await?;
    info!(
        attachment_id = %record_id,
        purchase_id = %owner_id,
        reclaimed = outcome.reclaimed,
        new_owner = ?outcome.new_owner,
        "attachment detached"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_attachment(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> AppResult<Response> {
    let content = state.store.open_blob(record_id).await?;
    let record = content.record;

    let content_type = HeaderValue::from_str(&record.media_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let inline = INLINE_MEDIA_TYPES.contains(&record.media_type.as_str());
    let disposition = HeaderValue::from_str(&content_disposition(&record.original_name, inline))
        .map_err(AppError::internal)?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(content.bytes),
    )
        .into_response())
}

/// Builds a Content-Disposition value with a plain ASCII `filename` and an
/// RFC 5987 `filename*` carrying the original UTF-8 name.
fn content_disposition(filename: &str, inline: bool) -> String {
    let kind = if inline { "inline" } else { "attachment" };
    let sanitized: String = filename
        .chars()
        .filter(|ch| !ch.is_control())
        .map(|ch| match ch {
            '"' | '\\' | '/' => '_',
            _ => ch,
        })
        .collect();
    if sanitized.trim().is_empty() {
        return kind.to_string();
    }

    let ascii: String = sanitized
        .chars()
        .map(|ch| if ch.is_ascii() { ch } else { '_' })
        .collect();
    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    format!("{kind}; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::content_disposition;

    #[test]
    fn disposition_escapes_quotes_and_non_ascii() {
        assert_eq!(
            content_disposition("re\"ceipt.pdf", true),
            "inline; filename=\"re_ceipt.pdf\"; filename*=UTF-8''re%5Fceipt%2Epdf"
        );
        assert_eq!(
            content_disposition("Quittung ü.txt", false),
            "attachment; filename=\"Quittung _.txt\"; filename*=UTF-8''Quittung%20%C3%BC%2Etxt"
        );
    }

    #[test]
    fn disposition_without_usable_name_has_no_filename() {
        assert_eq!(content_disposition("", false), "attachment");
        assert_eq!(content_disposition("\n", true), "inline");
    }
}
