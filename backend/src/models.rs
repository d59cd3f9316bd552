use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = purchases)]
pub struct Purchase {
    pub id: String,
    pub product_name: String,
    pub price_cents: i64,
    pub currency_code: String,
    pub purchase_date: NaiveDate,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = purchases)]
pub struct NewPurchase {
    pub id: String,
    pub product_name: String,
    pub price_cents: i64,
    pub currency_code: String,
    pub purchase_date: NaiveDate,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One logical reference from a purchase to a piece of stored content.
#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = attachments)]
#[diesel(belongs_to(Purchase))]
pub struct Attachment {
    pub id: String,
    pub purchase_id: String,
    pub original_name: String,
    pub stored_name: String,
    pub category: String,
    pub media_type: String,
    pub byte_size: i64,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = attachments)]
pub struct NewAttachment {
    pub id: String,
    pub purchase_id: String,
    pub original_name: String,
    pub stored_name: String,
    pub category: String,
    pub media_type: String,
    pub byte_size: i64,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
}

/// Ledger entry for a physical blob. Exists exactly while the file is on disk.
#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = blobs)]
#[diesel(primary_key(content_hash))]
pub struct Blob {
    pub content_hash: String,
    pub stored_name: String,
    pub owner_attachment_id: String,
    pub reference_count: i64,
    pub byte_size: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = blobs)]
pub struct NewBlob {
    pub content_hash: String,
    pub stored_name: String,
    pub owner_attachment_id: String,
    pub reference_count: i64,
    pub byte_size: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
