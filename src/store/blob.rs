//! Blob store — uploaded files referenced from task documents.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::error::BlobError;

/// Reference returned by a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    /// Store-relative path the blob can be fetched back with.
    pub path: String,
    pub size: u64,
}

/// Anywhere uploaded files can be put.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`. Only returns once the blob is retrievable.
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobRef, BlobError>;

    /// Read a blob back.
    async fn read(&self, path: &str) -> Result<Vec<u8>, BlobError>;
}

/// Blob store on the local filesystem.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        validate_relative(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobRef, BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename so a reader never sees a
        // half-written blob.
        let tmp = target.with_extension(format!("part-{}", Uuid::new_v4().simple()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(BlobError::UploadFailed {
                path: path.to_string(),
                reason: e.to_string(),
            });
        }

        info!(path, size = bytes.len(), "Blob stored");
        Ok(BlobRef {
            path: path.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        Ok(fs::read(self.resolve(path)?).await?)
    }
}

/// Reject absolute paths, parent references, and empty components.
fn validate_relative(path: &str) -> Result<(), BlobError> {
    let bad_segment = path
        .split('/')
        .any(|s| s.is_empty() || s == "." || s == ".." || s.contains('\\'));
    if bad_segment {
        return Err(BlobError::InvalidPath(path.to_string()));
    }
    let all_normal = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if all_normal {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

/// Runs of characters not allowed in a stored file name.
static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("file name pattern is valid"));

/// Reduce a client-supplied file name to a safe single path component.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = UNSAFE_FILE_CHARS.replace_all(base.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.chars().take(120).collect())
    }
}
