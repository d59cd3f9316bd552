//! Content-addressed attachment store.
//!
//! Uploaded bytes are written once per distinct SHA-256 digest. Every purchase
//! that references the content gets its own `attachments` row, and the
//! `blobs` ledger row for the digest names the single owning attachment and the
//! total number of references. The blob file lives exactly as long as that
//! ledger row.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::models::{Attachment, Blob, NewAttachment, NewBlob};
use crate::schema::{attachments, blobs};
use crate::storage::{BlobKey, BlobStorage, LocalBlobStorage};

pub mod audit;
mod locks;
mod record;

pub use audit::{LedgerIssue, SweepOptions, SweepReport};
pub use locks::{HashGuard, HashLocks};
pub use record::{
    content_hash, resolve_media_type, stored_name_for, AttachmentCategory, AttachmentRecord,
};

use record::parse_id;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found")]
    NotFound,
    #[error("{0}")]
    InvalidInput(String),
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("storage error: {0}")]
    StorageIo(#[from] io::Error),
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),
    #[error("database error: {0}")]
    Database(diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("blocking task failed: {0}")]
    Task(#[from] task::JoinError),
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => StoreError::NotFound,
            other => StoreError::Database(other),
        }
    }
}

impl StoreError {
    /// Caller mistakes, as opposed to failures of the store itself.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, StoreError::InvalidInput(_) | StoreError::TooLarge { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub max_upload_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: crate::config::DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

pub struct AttachRequest {
    pub owner_id: Uuid,
    pub bytes: Vec<u8>,
    pub original_name: String,
    pub category: AttachmentCategory,
    pub media_type: Option<String>,
}

#[derive(Debug)]
pub struct AttachOutcome {
    pub record: AttachmentRecord,
    /// `false` when the owner already had this exact content attached.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachOutcome {
    pub removed: Uuid,
    /// The last reference went away and the blob file was deleted.
    pub reclaimed: bool,
    /// Record that took over the blob when the owner was detached.
    pub new_owner: Option<Uuid>,
}

pub struct BlobContent {
    pub record: AttachmentRecord,
    pub bytes: Vec<u8>,
}

pub struct AttachmentStore {
    pool: DbPool,
    storage: Arc<dyn BlobStorage>,
    locks: HashLocks,
    config: StoreConfig,
}

impl AttachmentStore {
    pub fn new(pool: DbPool, storage: Arc<dyn BlobStorage>, config: StoreConfig) -> Self {
        Self {
            pool,
            storage,
            locks: HashLocks::new(),
            config,
        }
    }

    /// Store rooted at the configured uploads directory.
    pub fn from_config(pool: DbPool, config: &AppConfig) -> io::Result<Self> {
        let storage = LocalBlobStorage::open(config.uploads_dir.clone())?;
        Ok(Self::new(
            pool,
            Arc::new(storage),
            StoreConfig {
                max_upload_bytes: config.max_upload_bytes,
            },
        ))
    }

    pub async fn attach(&self, request: AttachRequest) -> StoreResult<AttachOutcome> {
        let AttachRequest {
            owner_id,
            bytes,
            original_name,
            category,
            media_type,
        } = request;

        if bytes.len() > self.config.max_upload_bytes {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                limit: self.config.max_upload_bytes,
            });
        }
        if bytes.is_empty() {
            return Err(StoreError::InvalidInput("file must not be empty".into()));
        }
        let original_name = original_name.trim().to_string();
        if original_name.is_empty() {
            return Err(StoreError::InvalidInput("filename is required".into()));
        }

        let hash = content_hash(&bytes);
        let media_type = resolve_media_type(media_type.as_deref(), &original_name);
        let _guard = self.locks.acquire(&hash).await;

        let owner = owner_id.to_string();
        let (existing, blob) = {
            let owner = owner.clone();
            let hash = hash.clone();
            self.with_conn(move |conn| {
                let existing = attachments::table
                    .filter(attachments::purchase_id.eq(&owner))
                    .filter(attachments::content_hash.eq(&hash))
                    .first::<Attachment>(conn)
                    .optional()?;
                let blob = blobs::table.find(&hash).first::<Blob>(conn).optional()?;
                Ok((existing, blob))
            })
            .await?
        };

        if let Some(row) = existing {
            info!(
                attachment_id = %row.id,
                owner_id = %owner_id,
                content_hash = %hash,
                "content already attached to owner; returning existing record"
            );
            return Ok(AttachOutcome {
                record: AttachmentRecord::from_row(row, blob.as_ref())?,
                created: false,
            });
        }

        let now = Utc::now().naive_utc();
        let mut new_row = NewAttachment {
            id: Uuid::new_v4().to_string(),
            purchase_id: owner,
            original_name,
            stored_name: String::new(),
            category: category.as_str().to_string(),
            media_type,
            byte_size: bytes.len() as i64,
            content_hash: hash.clone(),
            created_at: now,
        };

        if let Some(blob) = blob {
            new_row.stored_name = blob.stored_name.clone();
            let (row, blob) = self
                .with_conn(move |conn| {
                    conn.immediate_transaction(|conn| add_reference(conn, &new_row))
                })
                .await?;
            info!(
                attachment_id = %row.id,
                owner_id = %owner_id,
                content_hash = %hash,
                owner_attachment_id = %blob.owner_attachment_id,
                reference_count = blob.reference_count,
                "attachment deduplicated against existing blob"
            );
            return Ok(AttachOutcome {
                record: AttachmentRecord::from_row(row, Some(&blob))?,
                created: true,
            });
        }

        new_row.stored_name = stored_name_for(&hash, &new_row.original_name);
        let key = BlobKey::new(&hash, &new_row.stored_name)?;
        let byte_size = new_row.byte_size;
        self.storage
            .put_blob(&key, bytes)
            .await
            .map_err(|err| {
                error!(error = %err, content_hash = %hash, "failed to write blob");
                StoreError::StorageIo(err)
            })?;

        let new_blob = NewBlob {
            content_hash: hash.clone(),
            stored_name: new_row.stored_name.clone(),
            owner_attachment_id: new_row.id.clone(),
            reference_count: 1,
            byte_size,
            created_at: now,
            updated_at: now,
        };
        let committed = self
            .with_conn(move |conn| {
                conn.immediate_transaction(|conn| {
                    diesel::insert_into(attachments::table)
                        .values(&new_row)
                        .execute(conn)?;
                    diesel::insert_into(blobs::table)
                        .values(&new_blob)
                        .execute(conn)?;
                    let row: Attachment = attachments::table.find(&new_row.id).first(conn)?;
                    let blob: Blob = blobs::table.find(&new_blob.content_hash).first(conn)?;
                    Ok::<_, StoreError>((row, blob))
                })
            })
            .await;

        let (row, blob) = match committed {
            Ok(pair) => pair,
            Err(err) => {
                // No ledger row points at the new file.
                if let Err(cleanup) = self.storage.delete_blob(&key).await {
                    warn!(error = %cleanup, content_hash = %hash, "failed to remove uncommitted blob");
                }
                return Err(err);
            }
        };

        info!(
            attachment_id = %row.id,
            owner_id = %owner_id,
            content_hash = %hash,
            stored_name = %row.stored_name,
            byte_size,
            "stored new blob"
        );
        Ok(AttachOutcome {
            record: AttachmentRecord::from_row(row, Some(&blob))?,
            created: true,
        })
    }

    pub async fn list_for_owner(
        &self,
        owner_id: Uuid,
        category: Option<AttachmentCategory>,
    ) -> StoreResult<Vec<AttachmentRecord>> {
        let owner = owner_id.to_string();
        let (rows, blobs_by_hash) = self
            .with_conn(move |conn| {
                let mut query = attachments::table
                    .filter(attachments::purchase_id.eq(&owner))
                    .into_boxed();
                if let Some(category) = category {
                    query = query.filter(attachments::category.eq(category.as_str()));
                }
                let rows: Vec<Attachment> = query
                    .order((attachments::created_at.asc(), attachments::id.asc()))
                    .load(conn)?;
                let blobs_by_hash = load_blobs_for(conn, &rows)?;
                Ok((rows, blobs_by_hash))
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                let blob = blobs_by_hash.get(&row.content_hash);
                AttachmentRecord::from_row(row, blob)
            })
            .collect()
    }

    pub async fn fetch(&self, record_id: Uuid) -> StoreResult<AttachmentRecord> {
        let (row, blob) = self.load_with_blob(record_id).await?;
        AttachmentRecord::from_row(row, blob.as_ref())
    }

    pub async fn detach(&self, record_id: Uuid) -> StoreResult<DetachOutcome> {
        let (target, _) = self.load_with_blob(record_id).await?;
        let _guard = self.locks.acquire(&target.content_hash).await;

        let id = target.id.clone();
        let plan = self
            .with_conn(move |conn| conn.immediate_transaction(|conn| plan_detach(conn, &id)))
            .await?;

        let mut outcome = DetachOutcome {
            removed: record_id,
            reclaimed: false,
            new_owner: None,
        };
        match plan {
            DetachPlan::Released { owner, remaining } => {
                info!(
                    attachment_id = %record_id,
                    owner_attachment_id = %owner,
                    remaining,
                    "released non-owning reference"
                );
            }
            DetachPlan::Transferred { successor, remaining } => {
                info!(
                    attachment_id = %record_id,
                    new_owner_attachment_id = %successor,
                    remaining,
                    "transferred blob ownership"
                );
                outcome.new_owner = Some(parse_id(&successor)?);
            }
            DetachPlan::Reclaim { key, drained } => {
                if let Some(reason) = drained {
                    error!(
                        attachment_id = %record_id,
                        content_hash = %key.content_hash(),
                        reason,
                        "ledger inconsistency while detaching; reclaiming blob"
                    );
                }
                self.reclaim(&key).await;
                outcome.reclaimed = true;
            }
            DetachPlan::Untracked { content_hash } => {
                warn!(
                    attachment_id = %record_id,
                    content_hash = %content_hash,
                    "no blob ledger entry for attachment; removed record only"
                );
            }
        }

        Ok(outcome)
    }

    /// Detaches every record of an owner, one at a time so each blob's ledger
    /// stays consistent. Returns how many records were removed.
    pub async fn detach_all_for_owner(&self, owner_id: Uuid) -> StoreResult<usize> {
        let records = self.list_for_owner(owner_id, None).await?;
        let mut removed = 0;
        for record in records {
            match self.detach(record.id).await {
                Ok(_) => removed += 1,
                Err(StoreError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    pub async fn recategorize(
        &self,
        record_id: Uuid,
        category: AttachmentCategory,
    ) -> StoreResult<AttachmentRecord> {
        let id = record_id.to_string();
        let updated = self
            .with_conn(move |conn| {
                let now = Utc::now().naive_utc();
                Ok(diesel::update(attachments::table.find(&id))
                    .set((
                        attachments::category.eq(category.as_str()),
                        attachments::updated_at.eq(Some(now)),
                    ))
                    .execute(conn)?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        self.fetch(record_id).await
    }

    pub async fn open_blob(&self, record_id: Uuid) -> StoreResult<BlobContent> {
        let record = self.fetch(record_id).await?;
        let key = BlobKey::new(&record.content_hash, &record.stored_name)?;
        match self.storage.get_blob(&key).await {
            Ok(bytes) => Ok(BlobContent { record, bytes }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    attachment_id = %record_id,
                    stored_name = %record.stored_name,
                    "ledger row present but blob missing on disk"
                );
                Err(StoreError::NotFound)
            }
            Err(err) => Err(StoreError::StorageIo(err)),
        }
    }

    async fn reclaim(&self, key: &BlobKey) {
        match self.storage.delete_blob(key).await {
            Ok(true) => info!(stored_name = %key.stored_name(), "reclaimed blob"),
            Ok(false) => warn!(stored_name = %key.stored_name(), "blob already absent during reclaim"),
            Err(err) => error!(
                error = %err,
                stored_name = %key.stored_name(),
                "failed to delete blob; leaving it for the orphan sweep"
            ),
        }
    }

    async fn load_with_blob(&self, record_id: Uuid) -> StoreResult<(Attachment, Option<Blob>)> {
        let id = record_id.to_string();
        self.with_conn(move |conn| {
            let row: Attachment = attachments::table.find(&id).first(conn)?;
            let blob = blobs::table
                .find(&row.content_hash)
                .first::<Blob>(conn)
                .optional()?;
            Ok((row, blob))
        })
        .await
    }

    pub(crate) async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut SqliteConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn add_reference(conn: &mut SqliteConnection, new_row: &NewAttachment) -> StoreResult<(Attachment, Blob)> {
    let bumped = diesel::update(blobs::table.find(&new_row.content_hash))
        .set((
            blobs::reference_count.eq(blobs::reference_count + 1),
            blobs::updated_at.eq(new_row.created_at),
        ))
        .execute(conn)?;
    if bumped != 1 {
        return Err(StoreError::LedgerInconsistency(format!(
            "blob {} disappeared while adding a reference",
            new_row.content_hash
        )));
    }

    diesel::insert_into(attachments::table)
        .values(new_row)
        .execute(conn)?;
    let row: Attachment = attachments::table.find(&new_row.id).first(conn)?;
    let blob: Blob = blobs::table.find(&new_row.content_hash).first(conn)?;
    Ok((row, blob))
}

enum DetachPlan {
    Released { owner: String, remaining: i64 },
    Transferred { successor: String, remaining: i64 },
    Reclaim { key: BlobKey, drained: Option<&'static str> },
    Untracked { content_hash: String },
}

/// Applies the ledger side of a detach. Runs inside one transaction; the blob
/// file, if any, is deleted by the caller after commit.
fn plan_detach(conn: &mut SqliteConnection, record_id: &str) -> StoreResult<DetachPlan> {
    let target: Attachment = attachments::table.find(record_id).first(conn)?;
    let blob = blobs::table
        .find(&target.content_hash)
        .first::<Blob>(conn)
        .optional()?;

    let Some(blob) = blob else {
        diesel::delete(attachments::table.find(&target.id)).execute(conn)?;
        return Ok(DetachPlan::Untracked {
            content_hash: target.content_hash,
        });
    };

    let now = Utc::now().naive_utc();
    let remaining = blob.reference_count - 1;

    if blob.owner_attachment_id != target.id {
        if remaining <= 0 {
            // The owner's count should always include the owner itself.
            return release_blob(conn, &blob, &target, Some("non-owning detach drained the count"));
        }
        diesel::update(blobs::table.find(&blob.content_hash))
            .set((
                blobs::reference_count.eq(remaining),
                blobs::updated_at.eq(now),
            ))
            .execute(conn)?;
        diesel::delete(attachments::table.find(&target.id)).execute(conn)?;
        return Ok(DetachPlan::Released {
            owner: blob.owner_attachment_id,
            remaining,
        });
    }

    if remaining <= 0 {
        return release_blob(conn, &blob, &target, None);
    }

    let successor = attachments::table
        .filter(attachments::content_hash.eq(&blob.content_hash))
        .filter(attachments::id.ne(&target.id))
        .order((attachments::created_at.asc(), attachments::id.asc()))
        .first::<Attachment>(conn)
        .optional()?;

    let Some(successor) = successor else {
        return release_blob(
            conn,
            &blob,
            &target,
            Some("owner count exceeds the records sharing the hash"),
        );
    };

    diesel::update(blobs::table.find(&blob.content_hash))
        .set((
            blobs::owner_attachment_id.eq(&successor.id),
            blobs::reference_count.eq(remaining),
            blobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    diesel::delete(attachments::table.find(&target.id)).execute(conn)?;

    Ok(DetachPlan::Transferred {
        successor: successor.id,
        remaining,
    })
}

fn release_blob(
    conn: &mut SqliteConnection,
    blob: &Blob,
    target: &Attachment,
    drained: Option<&'static str>,
) -> StoreResult<DetachPlan> {
    let key = BlobKey::new(&blob.content_hash, &blob.stored_name)?;
    diesel::delete(blobs::table.find(&blob.content_hash)).execute(conn)?;
    diesel::delete(attachments::table.find(&target.id)).execute(conn)?;
    Ok(DetachPlan::Reclaim { key, drained })
}

fn load_blobs_for(
    conn: &mut SqliteConnection,
    rows: &[Attachment],
) -> StoreResult<HashMap<String, Blob>> {
    let mut hashes: Vec<&str> = rows.iter().map(|row| row.content_hash.as_str()).collect();
    hashes.sort_unstable();
    hashes.dedup();
    if hashes.is_empty() {
        return Ok(HashMap::new());
    }

    let found: Vec<Blob> = blobs::table
        .filter(blobs::content_hash.eq_any(hashes))
        .load(conn)?;
    Ok(found
        .into_iter()
        .map(|blob| (blob.content_hash.clone(), blob))
        .collect())
}
