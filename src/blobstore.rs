//! Artifact storage for fetched page bodies and screenshots.
//!
//! Every `put` gets a fresh key, so concurrent workers never overwrite each
//! other's artifacts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::types::BlobRef;

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const PNG_CONTENT_TYPE: &str = "image/png";

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a new key and return a reference to it.
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef>;

    async fn get(&self, key: &str) -> Result<Option<Blob>>;

    /// Link a viewer can follow to open the artifact.
    fn link(&self, blob: &BlobRef) -> String;
}

fn new_key() -> String {
    Uuid::new_v4().to_string()
}

fn blob_link(base_url: &str, blob: &BlobRef) -> String {
    format!("{}/blobs/{}", base_url.trim_end_matches('/'), blob.key())
}

/// Keeps artifacts in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    base_url: String,
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef> {
        let key = new_key();
        let blob = Blob {
            bytes,
            content_type: content_type.to_string(),
        };
        self.blobs.write().await.insert(key.clone(), blob);
        Ok(BlobRef(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    fn link(&self, blob: &BlobRef) -> String {
        blob_link(&self.base_url, blob)
    }
}

/// Writes one file per artifact into a directory.
///
/// Content types are tracked in memory; only keys issued by this store can be
/// read back, which also keeps lookups inside `dir`.
#[derive(Debug)]
pub struct DirBlobStore {
    dir: PathBuf,
    base_url: String,
    index: RwLock<HashMap<String, (PathBuf, String)>>,
}

impl DirBlobStore {
    pub async fn create(dir: impl AsRef<Path>, base_url: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create blob directory: {}", dir.display()))?;
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("failed to resolve blob directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            base_url: base_url.into(),
            index: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Links to every stored file as seen from a page in `from`: a relative
    /// path when the store lives below `from`, a `file://` URL otherwise.
    pub async fn file_links(&self, from: &Path) -> Result<HashMap<String, String>> {
        let from = tokio::fs::canonicalize(from)
            .await
            .with_context(|| format!("failed to resolve page directory: {}", from.display()))?;
        let index = self.index.read().await;
        Ok(index
            .iter()
            .map(|(key, (path, _))| (key.clone(), file_link(path, &from)))
            .collect())
    }
}

fn file_link(path: &Path, from: &Path) -> String {
    match path.strip_prefix(from) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => Url::from_file_path(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|()| path.display().to_string()),
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "text/html" => "html",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "application/json" => "json",
        "text/plain" => "txt",
        _ => "bin",
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef> {
        let key = new_key();
        let path = self
            .dir
            .join(format!("{key}.{}", extension_for(content_type)));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write blob: {}", path.display()))?;
        self.index
            .write()
            .await
            .insert(key.clone(), (path, content_type.to_string()));
        Ok(BlobRef(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        let entry = self.index.read().await.get(key).cloned();
        let Some((path, content_type)) = entry else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob: {}", path.display()))?;
        Ok(Some(Blob {
            bytes,
            content_type,
        }))
    }

    fn link(&self, blob: &BlobRef) -> String {
        blob_link(&self.base_url, blob)
    }
}
