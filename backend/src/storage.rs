use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::task;
use walkdir::WalkDir;

/// Length of a hex-encoded SHA-256 digest.
pub const CONTENT_HASH_LEN: usize = 64;

/// Address of a blob inside the storage root: `<h[0:2]>/<h[2:4]>/<stored_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    content_hash: String,
    stored_name: String,
}

impl BlobKey {
    pub fn new(content_hash: &str, stored_name: &str) -> io::Result<Self> {
        if !is_content_hash(content_hash) {
            return Err(invalid_key(format!("malformed content hash '{content_hash}'")));
        }
        let valid_name = stored_name.starts_with(content_hash)
            && stored_name[content_hash.len()..]
                .chars()
                .all(|ch| ch == '.' || ch.is_ascii_alphanumeric())
            && !stored_name.contains("..");
        if !valid_name {
            return Err(invalid_key(format!(
                "stored name '{stored_name}' does not belong to hash {content_hash}"
            )));
        }

        Ok(Self {
            content_hash: content_hash.to_string(),
            stored_name: stored_name.to_string(),
        })
    }

    /// Recovers a key from a file name found on disk, if it looks like one of ours.
    pub fn from_stored_name(stored_name: &str) -> Option<Self> {
        let content_hash = stored_name.get(..CONTENT_HASH_LEN)?;
        Self::new(content_hash, stored_name).ok()
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn stored_name(&self) -> &str {
        &self.stored_name
    }

    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.content_hash[0..2]);
        path.push(&self.content_hash[2..4]);
        path.push(&self.stored_name);
        path
    }
}

pub fn is_content_hash(value: &str) -> bool {
    value.len() == CONTENT_HASH_LEN
        && value
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
}

fn invalid_key(message: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, message)
}

/// A blob file found while scanning the storage root.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: BlobKey,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

#[async_trait]
pub trait BlobStorage: Send + Sync + 'static {
    /// Writes the blob. Readers never observe a partially written file.
    async fn put_blob(&self, key: &BlobKey, bytes: Vec<u8>) -> io::Result<()>;

    /// Reads the whole blob; `ErrorKind::NotFound` when absent.
    async fn get_blob(&self, key: &BlobKey) -> io::Result<Vec<u8>>;

    /// Removes the blob. Returns `false` when it was already gone.
    async fn delete_blob(&self, key: &BlobKey) -> io::Result<bool>;

    async fn contains_blob(&self, key: &BlobKey) -> io::Result<bool>;

    /// Current size and modification time, or `None` when absent.
    async fn stat_blob(&self, key: &BlobKey) -> io::Result<Option<StoredBlob>>;

    async fn list_blobs(&self) -> io::Result<Vec<StoredBlob>>;

    /// Removes empty shard directories, returning how many were removed.
    async fn prune_empty_shards(&self) -> io::Result<usize>;
}

/// Sharded directory tree on the local filesystem.
pub struct LocalBlobStorage {
    root: PathBuf,
}

impl LocalBlobStorage {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn put_blob(&self, key: &BlobKey, bytes: Vec<u8>) -> io::Result<()> {
        let destination = self.path_for(key);
        task::spawn_blocking(move || write_atomically(&destination, &bytes))
            .await
            .map_err(io::Error::other)?
    }

    async fn get_blob(&self, key: &BlobKey) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key)).await
    }

    async fn delete_blob(&self, key: &BlobKey) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn contains_blob(&self, key: &BlobKey) -> io::Result<bool> {
        tokio::fs::try_exists(self.path_for(key)).await
    }

    async fn stat_blob(&self, key: &BlobKey) -> io::Result<Option<StoredBlob>> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(metadata) => Ok(Some(StoredBlob {
                key: key.clone(),
                size_bytes: metadata.len(),
                modified: metadata.modified().ok(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_blobs(&self) -> io::Result<Vec<StoredBlob>> {
        let root = self.root.clone();
        task::spawn_blocking(move || scan_blobs(&root))
            .await
            .map_err(io::Error::other)?
    }

    async fn prune_empty_shards(&self) -> io::Result<usize> {
        let root = self.root.clone();
        task::spawn_blocking(move || prune_shards(&root))
            .await
            .map_err(io::Error::other)?
    }
}

fn write_atomically(destination: &Path, bytes: &[u8]) -> io::Result<()> {
    let shard_dir = destination
        .parent()
        .ok_or_else(|| invalid_key("blob path has no parent directory".to_string()))?;
    fs::create_dir_all(shard_dir)?;

    let mut staged = NamedTempFile::new_in(shard_dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|err| err.error)?;
    Ok(())
}

fn scan_blobs(root: &Path) -> io::Result<Vec<StoredBlob>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = entry.file_name().to_str().and_then(BlobKey::from_stored_name) else {
            continue;
        };
        // A file filed under the wrong shard is not ours to manage.
        if entry.path() != root.join(key.relative_path()) {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::from)?;
        found.push(StoredBlob {
            key,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }
    Ok(found)
}

fn prune_shards(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    // contents_first visits the inner shard level before its parent.
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        // Non-empty directories refuse removal; that is the filter.
        if fs::remove_dir(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
