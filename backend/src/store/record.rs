use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{Attachment, Blob};

const MAX_EXTENSION_LEN: usize = 16;
const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentCategory {
    Receipt,
    Manual,
    Photo,
    Warranty,
    Other,
}

impl AttachmentCategory {
    pub const ALL: [AttachmentCategory; 5] = [
        AttachmentCategory::Receipt,
        AttachmentCategory::Manual,
        AttachmentCategory::Photo,
        AttachmentCategory::Warranty,
        AttachmentCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentCategory::Receipt => "receipt",
            AttachmentCategory::Manual => "manual",
            AttachmentCategory::Photo => "photo",
            AttachmentCategory::Warranty => "warranty",
            AttachmentCategory::Other => "other",
        }
    }
}

impl fmt::Display for AttachmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentCategory {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::ALL.iter().map(|c| c.as_str()).collect();
                StoreError::InvalidInput(format!(
                    "invalid category '{normalized}'. Allowed categories: {}",
                    allowed.join(", ")
                ))
            })
    }
}

/// A purchase's reference to stored content, with its share of the blob's
/// reference count: the owning record carries the total, every other record 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub category: AttachmentCategory,
    pub media_type: String,
    pub byte_size: i64,
    pub content_hash: String,
    pub reference_count: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: Option<NaiveDateTime>,
}

impl AttachmentRecord {
    pub(crate) fn from_row(row: Attachment, blob: Option<&Blob>) -> StoreResult<Self> {
        let reference_count = match blob {
            Some(blob) if blob.owner_attachment_id == row.id => blob.reference_count,
            _ => 0,
        };

        Ok(Self {
            id: parse_id(&row.id)?,
            owner_id: parse_id(&row.purchase_id)?,
            category: row.category.parse().map_err(|_| {
                StoreError::LedgerInconsistency(format!(
                    "attachment {} has unknown category '{}'",
                    row.id, row.category
                ))
            })?,
            original_name: row.original_name,
            stored_name: row.stored_name,
            media_type: row.media_type,
            byte_size: row.byte_size,
            content_hash: row.content_hash,
            reference_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn parse_id(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| StoreError::LedgerInconsistency(format!("malformed identifier '{raw}'")))
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `<hash><ext>`, keeping the uploader's extension as written when it is short
/// and plain.
pub fn stored_name_for(content_hash: &str, original_name: &str) -> String {
    let extension = Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|ch| ch.is_ascii_alphanumeric())
        });

    match extension {
        Some(ext) => format!("{content_hash}.{ext}"),
        None => content_hash.to_string(),
    }
}

pub fn resolve_media_type(declared: Option<&str>, original_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            mime_guess::from_path(original_name)
                .first()
                .map(|mime| mime.essence_str().to_string())
        })
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string())
}
