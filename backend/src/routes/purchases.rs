use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{NaiveDate, Utc};
use diesel::dsl::exists;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{prelude::*, select, SqliteConnection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::to_iso;
use crate::error::{AppError, AppResult};
use crate::models::{NewPurchase, Purchase};
use crate::schema::purchases;
use crate::state::AppState;

const DEFAULT_CURRENCY: &str = "USD";

#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    pub product_name: String,
    pub price_cents: i64,
    pub currency_code: Option<String>,
    pub purchase_date: NaiveDate,
    pub notes: Option<String>,
}

#[derive(Serialize)]
pub struct PurchaseResponse {
    pub id: Uuid,
    pub product_name: String,
    pub price_cents: i64,
    pub currency_code: String,
    pub purchase_date: NaiveDate,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<Purchase> for PurchaseResponse {
    type Error = AppError;

    fn try_from(row: Purchase) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).map_err(AppError::internal)?,
            product_name: row.product_name,
            price_cents: row.price_cents,
            currency_code: row.currency_code,
            purchase_date: row.purchase_date,
            notes: row.notes,
            created_at: to_iso(row.created_at),
            updated_at: to_iso(row.updated_at),
        })
    }
}

/// The owner check every attachment route runs before touching the store.
pub fn purchase_exists(conn: &mut SqliteConnection, purchase_id: Uuid) -> QueryResult<bool> {
    select(exists(
        purchases::table.filter(purchases::id.eq(purchase_id.to_string())),
    ))
    .get_result(conn)
}

fn normalize_currency(value: Option<&str>) -> AppResult<String> {
    let code = value
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .unwrap_or(DEFAULT_CURRENCY)
        .to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Err(AppError::bad_request(
            "currency_code must be a three-letter ISO 4217 code",
        ));
    }
    Ok(code)
}

pub async fn create_purchase(
    State(state): State<AppState>,
    Json(payload): Json<CreatePurchaseRequest>,
) -> AppResult<(StatusCode, Json<PurchaseResponse>)> {
    let product_name = payload.product_name.trim();
    if product_name.is_empty() {
        return Err(AppError::bad_request("product_name must not be empty"));
    }
    if payload.price_cents < 0 {
        return Err(AppError::bad_request("price_cents must not be negative"));
    }
    let currency_code = normalize_currency(payload.currency_code.as_deref())?;
    let notes = payload
        .notes
        .map(|notes| notes.trim().to_string())
        .filter(|notes| !notes.is_empty());

    let now = Utc::now().naive_utc();
    let row = NewPurchase {
        id: Uuid::new_v4().to_string(),
        product_name: product_name.to_string(),
        price_cents: payload.price_cents,
        currency_code,
        purchase_date: payload.purchase_date,
        notes,
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.db()?;
    diesel::insert_into(purchases::table)
        .values(&row)
        .execute(&mut conn)?;
    let created: Purchase = purchases::table.find(&row.id).first(&mut conn)?;

    info!(purchase_id = %created.id, product_name = %created.product_name, "purchase created");
    Ok((StatusCode::CREATED, Json(created.try_into()?)))
}

pub async fn list_purchases(State(state): State<AppState>) -> AppResult<Json<Vec<PurchaseResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<Purchase> = purchases::table
        .order((
            purchases::purchase_date.desc(),
            purchases::created_at.desc(),
        ))
        .load(&mut conn)?;

    let response = rows
        .into_iter()
        .map(PurchaseResponse::try_from)
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Json(response))
}

pub async fn get_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<Uuid>,
) -> AppResult<Json<PurchaseResponse>> {
    let mut conn = state.db()?;
    let row: Purchase = purchases::table
        .find(purchase_id.to_string())
        .first(&mut conn)?;
    Ok(Json(row.try_into()?))
}

pub async fn delete_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    {
        let mut conn = state.db()?;
        if !purchase_exists(&mut conn, purchase_id)? {
            return Err(AppError::not_found());
        }
    }

    let detached = state.store.detach_all_for_owner(purchase_id).await?;

    let mut conn = state.db()?;
    match diesel::delete(purchases::table.find(purchase_id.to_string())).execute(&mut conn) {
        Ok(0) => Err(AppError::not_found()),
        Ok(_) => {
            info!(purchase_id = %purchase_id, detached, "purchase deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)) => {
            warn!(purchase_id = %purchase_id, "attachment added while deleting purchase");
            Err(AppError::bad_request(
                "purchase gained new attachments while being deleted; retry",
            ))
        }
        Err(err) => Err(err.into()),
    }
}
