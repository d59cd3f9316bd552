use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, SystemTime};

use diesel::dsl::count_star;
use diesel::prelude::*;
use tracing::{info, warn};

use super::{AttachmentStore, StoreResult};
use crate::models::{Attachment, Blob};
use crate::schema::{attachments, blobs};
use crate::storage::BlobKey;

/// A disagreement between the ledger tables and each other or the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerIssue {
    CountMismatch {
        content_hash: String,
        recorded: i64,
        actual: i64,
    },
    OwnerMissing {
        content_hash: String,
        owner_attachment_id: String,
    },
    OwnerHashMismatch {
        content_hash: String,
        owner_attachment_id: String,
        owner_hash: String,
    },
    UntrackedRecords {
        content_hash: String,
        records: i64,
    },
    BlobFileMissing {
        content_hash: String,
        stored_name: String,
    },
}

impl fmt::Display for LedgerIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerIssue::CountMismatch {
                content_hash,
                recorded,
                actual,
            } => write!(
                f,
                "{content_hash}: ledger counts {recorded} references but {actual} records exist"
            ),
            LedgerIssue::OwnerMissing {
                content_hash,
                owner_attachment_id,
            } => write!(
                f,
                "{content_hash}: owning attachment {owner_attachment_id} does not exist"
            ),
            LedgerIssue::OwnerHashMismatch {
                content_hash,
                owner_attachment_id,
                owner_hash,
            } => write!(
                f,
                "{content_hash}: owning attachment {owner_attachment_id} holds {owner_hash}"
            ),
            LedgerIssue::UntrackedRecords {
                content_hash,
                records,
            } => write!(f, "{content_hash}: {records} record(s) without a blob entry"),
            LedgerIssue::BlobFileMissing {
                content_hash,
                stored_name,
            } => write!(f, "{content_hash}: blob file {stored_name} is missing"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub dry_run: bool,
    /// Files younger than this are left alone; they may belong to an attach
    /// that has written its blob but not committed yet.
    pub min_age: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            min_age: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub orphans: Vec<String>,
    pub removed: usize,
    pub bytes_reclaimed: u64,
    pub pruned_shards: usize,
}

impl AttachmentStore {
    pub async fn verify_ledger(&self) -> StoreResult<Vec<LedgerIssue>> {
        let (ledger, counts, owners) = self
            .with_conn(|conn| {
                let ledger: Vec<Blob> = blobs::table.order(blobs::content_hash.asc()).load(conn)?;
                let counts: Vec<(String, i64)> = attachments::table
                    .group_by(attachments::content_hash)
                    .select((attachments::content_hash, count_star()))
                    .order(attachments::content_hash.asc())
                    .load(conn)?;
                let owner_ids: Vec<&str> = ledger
                    .iter()
                    .map(|blob| blob.owner_attachment_id.as_str())
                    .collect();
                let owners: Vec<Attachment> = attachments::table
                    .filter(attachments::id.eq_any(owner_ids))
                    .load(conn)?;
                Ok((ledger, counts, owners))
            })
            .await?;

        let counts: HashMap<String, i64> = counts.into_iter().collect();
        let owners: HashMap<String, Attachment> = owners
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();

        let mut issues = Vec::new();
        let mut tracked = HashSet::new();
        for blob in &ledger {
            tracked.insert(blob.content_hash.as_str());

            let actual = counts.get(&blob.content_hash).copied().unwrap_or(0);
            if actual != blob.reference_count {
                issues.push(LedgerIssue::CountMismatch {
                    content_hash: blob.content_hash.clone(),
                    recorded: blob.reference_count,
                    actual,
                });
            }

            match owners.get(&blob.owner_attachment_id) {
                None => issues.push(LedgerIssue::OwnerMissing {
                    content_hash: blob.content_hash.clone(),
                    owner_attachment_id: blob.owner_attachment_id.clone(),
                }),
                Some(owner) if owner.content_hash != blob.content_hash => {
                    issues.push(LedgerIssue::OwnerHashMismatch {
                        content_hash: blob.content_hash.clone(),
                        owner_attachment_id: owner.id.clone(),
                        owner_hash: owner.content_hash.clone(),
                    })
                }
                Some(_) => {}
            }

            let key = BlobKey::new(&blob.content_hash, &blob.stored_name)?;
            if !self.storage.contains_blob(&key).await? {
                issues.push(LedgerIssue::BlobFileMissing {
                    content_hash: blob.content_hash.clone(),
                    stored_name: blob.stored_name.clone(),
                });
            }
        }

        let mut untracked: Vec<(&String, &i64)> = counts
            .iter()
            .filter(|(hash, _)| !tracked.contains(hash.as_str()))
            .collect();
        untracked.sort();
        issues.extend(untracked.into_iter().map(|(hash, records)| {
            LedgerIssue::UntrackedRecords {
                content_hash: hash.clone(),
                records: *records,
            }
        }));

        for issue in &issues {
            warn!(issue = %issue, "ledger issue");
        }
        Ok(issues)
    }

    /// Removes blob files that no ledger entry accounts for.
    ///
    /// The hash locks only cover this process. Against a live server the
    /// `min_age` grace and the modification-time recheck below narrow the race
    /// with a concurrent attach to the instant between that recheck and the
    /// delete; run the sweep with the server stopped to close it.
    pub async fn sweep_orphans(&self, options: SweepOptions) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = SystemTime::now();

        for found in self.storage.list_blobs().await? {
            report.scanned += 1;
            if is_fresh(found.modified, now, options.min_age) {
                continue;
            }

            let _guard = self.locks.acquire(found.key.content_hash()).await;
            if self.is_tracked(&found.key).await? {
                continue;
            }

            // A rename by another process replaces the file and its mtime.
            let Some(current) = self.storage.stat_blob(&found.key).await? else {
                continue;
            };
            if current.modified != found.modified {
                info!(stored_name = %found.key.stored_name(), "blob rewritten since scan; skipping");
                continue;
            }

            report.orphans.push(found.key.stored_name().to_string());
            if options.dry_run {
                info!(stored_name = %found.key.stored_name(), size_bytes = current.size_bytes, "orphan blob (dry run)");
                continue;
            }

            if self.storage.delete_blob(&found.key).await? {
                report.removed += 1;
                report.bytes_reclaimed += current.size_bytes;
                info!(stored_name = %found.key.stored_name(), size_bytes = current.size_bytes, "removed orphan blob");
            }
        }

        if !options.dry_run {
            report.pruned_shards = self.storage.prune_empty_shards().await?;
        }

        info!(
            scanned = report.scanned,
            orphans = report.orphans.len(),
            removed = report.removed,
            bytes_reclaimed = report.bytes_reclaimed,
            pruned_shards = report.pruned_shards,
            dry_run = options.dry_run,
            "orphan sweep finished"
        );
        Ok(report)
    }

    async fn is_tracked(&self, key: &BlobKey) -> StoreResult<bool> {
        let hash = key.content_hash().to_string();
        let stored_name = key.stored_name().to_string();
        self.with_conn(move |conn| {
            let count: i64 = blobs::table
                .filter(blobs::content_hash.eq(&hash))
                .filter(blobs::stored_name.eq(&stored_name))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
        .await
    }
}

/// `min_age` of zero disables the grace period.
fn is_fresh(modified: Option<SystemTime>, now: SystemTime, min_age: Duration) -> bool {
    !min_age.is_zero()
        && modified
            .and_then(|modified| now.duration_since(modified).ok())
            .map_or(true, |age| age < min_age)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::store::tests::{attach, fixture, Fixture};
    use crate::store::{content_hash, stored_name_for, StoreConfig};
    use crate::storage::{BlobStorage, LocalBlobStorage, StoredBlob};

    const NO_GRACE: SweepOptions = SweepOptions {
        dry_run: false,
        min_age: Duration::ZERO,
    };

    #[tokio::test]
    async fn healthy_ledger_has_no_issues() {
        let fx = fixture().await;
        let a = fx.purchase().await;
        let b = fx.purchase().await;
        attach(&fx.store, a, b"shared", "a.pdf").await;
        attach(&fx.store, b, b"shared", "b.pdf").await;
        attach(&fx.store, b, b"solo", "c.png").await;

        assert!(fx.store.verify_ledger().await.expect("verify").is_empty());
    }

    #[tokio::test]
    async fn reports_missing_files_and_untracked_records() {
        let fx = fixture().await;
        let owner = fx.purchase().await;
        let kept = attach(&fx.store, owner, b"kept", "kept.pdf").await;
        let lost = attach(&fx.store, owner, b"lost", "lost.pdf").await;

        let key = BlobKey::new(&kept.content_hash, &kept.stored_name).expect("key");
        fx.storage.delete_blob(&key).await.expect("delete");
        let lost_hash = lost.content_hash.clone();
        fx.store
            .with_conn(move |conn| {
                diesel::delete(blobs::table.find(&lost_hash)).execute(conn)?;
                Ok(())
            })
            .await
            .expect("drop ledger row");

        let issues = fx.store.verify_ledger().await.expect("verify");
        assert_eq!(issues.len(), 2);
        assert!(issues.contains(&LedgerIssue::BlobFileMissing {
            content_hash: kept.content_hash.clone(),
            stored_name: kept.stored_name.clone(),
        }));
        assert!(issues.contains(&LedgerIssue::UntrackedRecords {
            content_hash: lost.content_hash.clone(),
            records: 1,
        }));
    }

    #[tokio::test]
    async fn sweep_removes_only_untracked_files() {
        let fx = fixture().await;
        let owner = fx.purchase().await;
        let kept = attach(&fx.store, owner, b"tracked bytes", "kept.jpg").await;

        let orphan_hash = content_hash(b"crashed before commit");
        let orphan = BlobKey::new(&orphan_hash, &stored_name_for(&orphan_hash, "x.pdf"))
            .expect("key");
        fx.storage
            .put_blob(&orphan, b"crashed before commit".to_vec())
            .await
            .expect("put orphan");

        let dry = fx
            .store
            .sweep_orphans(SweepOptions {
                dry_run: true,
                ..NO_GRACE
            })
            .await
            .expect("dry run");
        assert_eq!(dry.orphans, vec![orphan.stored_name().to_string()]);
        assert_eq!(dry.removed, 0);
        assert!(fx.storage.contains_blob(&orphan).await.expect("exists"));

        let report = fx.store.sweep_orphans(NO_GRACE).await.expect("sweep");
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_reclaimed, 21);
        assert!(!fx.storage.contains_blob(&orphan).await.expect("gone"));

        let kept_key = BlobKey::new(&kept.content_hash, &kept.stored_name).expect("key");
        assert!(fx.storage.contains_blob(&kept_key).await.expect("kept"));
        assert!(fx.store.verify_ledger().await.expect("verify").is_empty());
    }

    #[tokio::test]
    async fn sweep_leaves_recent_files_alone() {
        let fx = fixture().await;
        let hash = content_hash(b"in flight");
        let key = BlobKey::new(&hash, &hash).expect("key");
        fx.storage
            .put_blob(&key, b"in flight".to_vec())
            .await
            .expect("put");

        let report = fx
            .store
            .sweep_orphans(SweepOptions::default())
            .await
            .expect("sweep");
        assert_eq!(report.scanned, 1);
        assert!(report.orphans.is_empty());
        assert!(fx.storage.contains_blob(&key).await.expect("still there"));
    }

    /// Reports every file as written at the epoch, as a scan taken long
    /// before a concurrent rewrite would.
    struct StaleListing {
        inner: Arc<LocalBlobStorage>,
    }

    #[async_trait]
    impl BlobStorage for StaleListing {
        async fn put_blob(&self, key: &BlobKey, bytes: Vec<u8>) -> io::Result<()> {
            self.inner.put_blob(key, bytes).await
        }

        async fn get_blob(&self, key: &BlobKey) -> io::Result<Vec<u8>> {
            self.inner.get_blob(key).await
        }

        async fn delete_blob(&self, key: &BlobKey) -> io::Result<bool> {
            self.inner.delete_blob(key).await
        }

        async fn contains_blob(&self, key: &BlobKey) -> io::Result<bool> {
            self.inner.contains_blob(key).await
        }

        async fn stat_blob(&self, key: &BlobKey) -> io::Result<Option<StoredBlob>> {
            self.inner.stat_blob(key).await
        }

        async fn list_blobs(&self) -> io::Result<Vec<StoredBlob>> {
            let mut listed = self.inner.list_blobs().await?;
            for blob in &mut listed {
                blob.modified = Some(SystemTime::UNIX_EPOCH);
            }
            Ok(listed)
        }

        async fn prune_empty_shards(&self) -> io::Result<usize> {
            self.inner.prune_empty_shards().await
        }
    }

    #[tokio::test]
    async fn sweep_skips_files_rewritten_after_the_scan() {
        let fx = Fixture::build(StoreConfig::default(), |inner| {
            Arc::new(StaleListing { inner }) as Arc<dyn BlobStorage>
        });
        let hash = content_hash(b"renamed in by the server");
        let key = BlobKey::new(&hash, &hash).expect("key");
        fx.storage
            .put_blob(&key, b"renamed in by the server".to_vec())
            .await
            .expect("put");

        let report = fx
            .store
            .sweep_orphans(SweepOptions::default())
            .await
            .expect("sweep");

        assert_eq!(report.scanned, 1);
        assert!(report.orphans.is_empty());
        assert_eq!(report.removed, 0);
        assert!(fx.storage.contains_blob(&key).await.expect("still there"));
    }

    #[test]
    fn freshness_honours_min_age() {
        let now = SystemTime::now();
        let minute_ago = now - Duration::from_secs(60);
        assert!(is_fresh(Some(minute_ago), now, Duration::from_secs(15 * 60)));
        assert!(!is_fresh(Some(minute_ago), now, Duration::from_secs(30)));
        assert!(!is_fresh(Some(now), now, Duration::ZERO));
        assert!(is_fresh(None, now, Duration::from_secs(30)));
    }
}
