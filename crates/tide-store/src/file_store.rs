//! File-based content storage backend.
//!
//! Stores one file per blob with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tide_types::ContentHash;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::traits::ContentStore;

/// File-based content store with 2-level fan-out directory layout.
///
/// Writes are atomic: data is written to a temporary file first, then
/// renamed into place, so a crash never leaves a half-written blob.
pub struct FileStore {
    base_dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

#[async_trait::async_trait]
impl ContentStore for FileStore {
    async fn put(&self, data: Bytes) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::from_data(&data);
        let path = self.blob_path(&hash);

        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Concurrent puts of the same blob each get their own temp file.
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("tmp{n}"));
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(%hash, path = %path.display(), size = data.len(), "stored blob to file");
        Ok(hash)
    }

    async fn get(&self, hash: ContentHash) -> Result<Option<Bytes>, StoreError> {
        let path = self.blob_path(&hash);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                // Verify-on-read: a corrupt blob is never handed to the caller.
                let actual = ContentHash::from_data(&data);
                if actual != hash {
                    error!(expected = %hash, %actual, "blob corruption detected on read");
                    return Err(StoreError::Corrupt {
                        expected: hash,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn contains(&self, hash: ContentHash) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.blob_path(&hash)).await?)
    }

    async fn list(&self) -> Result<Vec<ContentHash>, StoreError> {
        let mut hashes = Vec::new();

        // Walk the 2-level fan-out: base/XX/YY/<hex>
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && let Ok(hash) = name.parse::<ContentHash>()
                    {
                        hashes.push(hash);
                    }
                }
            }
        }
        Ok(hashes)
    }
}
