//! In-memory storage driver for tests and ephemeral caching.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    guess_mime, once_stream, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TimedOptions,
};
use crate::expiration::{is_expired, resolve_expiry};

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    metadata: FileMetadata,
    /// Epoch milliseconds, set by `put_timed`.
    expires_at: Option<i64>,
}

/// In-memory storage driver.
///
/// Keys form a flat namespace: there are no real directories, so
/// `list_directories` is always empty and `make_directory` does nothing.
/// Objects have no external access model, so `url` and `temporary_url`
/// are unsupported. All data is lost on drop.
#[derive(Clone, Default)]
pub struct BufferDriver {
    storage: Arc<RwLock<HashMap<String, Entry>>>,
}

impl BufferDriver {
    /// Create a new empty buffer driver.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &StoragePath) -> Result<String> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(path.as_str())
    }

    fn entry(path: &StoragePath, data: Bytes, options: &PutOptions) -> Entry {
        let metadata = FileMetadata {
            path: path.clone(),
            size: data.len() as u64,
            mime_type: options.content_type.clone().or_else(|| guess_mime(path)),
            last_modified: Some(Utc::now()),
            visibility: Some(options.visibility.unwrap_or(Visibility::Private)),
        };
        Entry {
            data,
            metadata,
            expires_at: None,
        }
    }

    /// Entry overwriting `existing`: no expiry, and the old visibility
    /// unless `options` sets one.
    fn replacement(existing: Option<&Entry>, path: &StoragePath, data: Bytes, options: &PutOptions) -> Entry {
        let mut entry = Self::entry(path, data, options);
        if options.visibility.is_none() {
            if let Some(existing) = existing {
                entry.metadata.visibility = existing.metadata.visibility;
            }
        }
        entry
    }

    /// Keys under `dir`, relative to it.
    async fn relative_keys(&self, dir: &StoragePath, recursive: bool) -> Vec<StoragePath> {
        let storage = self.storage.read().await;
        let mut results: Vec<StoragePath> = storage
            .values()
            .filter_map(|entry| entry.metadata.path.strip_prefix(dir))
            .filter(|relative| !relative.is_root())
            .filter(|relative| recursive || relative.components().len() == 1)
            .collect();
        results.sort();
        results
    }

    /// Add `content` to one end of the entry in place, keeping its
    /// visibility and expiry. A missing entry starts empty.
    async fn splice(&self, path: &StoragePath, content: Bytes, at_front: bool) -> Result<()> {
        let key = Self::key(path)?;
        let mut storage = self.storage.write().await;
        match storage.get_mut(&key) {
            Some(entry) => {
                let mut data = BytesMut::with_capacity(entry.data.len() + content.len());
                if at_front {
                    data.extend_from_slice(&content);
                    data.extend_from_slice(&entry.data);
                } else {
                    data.extend_from_slice(&entry.data);
                    data.extend_from_slice(&content);
                }
                entry.metadata.size = data.len() as u64;
                entry.metadata.last_modified = Some(Utc::now());
                entry.data = data.freeze();
            }
            None => {
                storage.insert(key, Self::entry(path, content, &PutOptions::default()));
            }
        }
        Ok(())
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}

#[async_trait]
impl StorageDriver for BufferDriver {
    fn name(&self) -> &str {
        "buffer"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata: true,
            visibility: true,
            timed: true,
            native_append: true,
            ..Capabilities::default()
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        let key = Self::key(path)?;
        let mut storage = self.storage.write().await;
        let entry = Self::replacement(storage.get(&key), path, content, &options);
        storage.insert(key, entry);
        Ok(())
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let key = Self::key(path)?;
        self.storage
            .read()
            .await
            .get(&key)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let key = Self::key(path)?;
        match self.storage.write().await.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        let key = Self::key(path)?;
        Ok(self.storage.read().await.contains_key(&key))
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_key = Self::key(from)?;
        let to_key = Self::key(to)?;
        let mut storage = self.storage.write().await;

        let source = storage
            .get(&from_key)
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", from)))?;

        let mut copy = source.clone();
        copy.metadata.path = to.clone();
        copy.metadata.last_modified = Some(Utc::now());
        copy.expires_at = None;
        storage.insert(to_key, copy);
        Ok(())
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_key = Self::key(from)?;
        let to_key = Self::key(to)?;
        let mut storage = self.storage.write().await;

        let mut entry = storage
            .remove(&from_key)
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", from)))?;
        entry.metadata.path = to.clone();
        storage.insert(to_key, entry);
        Ok(())
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        Ok(self.relative_keys(dir, recursive).await)
    }

    async fn list_directories(
        &self,
        _dir: &StoragePath,
        _recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        Ok(Vec::new())
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        let data = self.get(path).await?;
        Ok(once_stream(data))
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        self.splice(path, content, true).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        self.splice(path, content, false).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let key = Self::key(path)?;
        self.storage
            .read()
            .await
            .get(&key)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn make_directory(&self, _path: &StoragePath) -> Result<()> {
        Ok(())
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        let mut storage = self.storage.write().await;
        let before = storage.len();
        storage.retain(|_, entry| {
            entry.metadata.path == *path || !entry.metadata.path.starts_with(path)
        });
        if storage.len() == before {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }
        Ok(())
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        let metadata = self.metadata(path).await?;
        Ok(metadata.visibility.unwrap_or(Visibility::Private))
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let key = Self::key(path)?;
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))?;
        entry.metadata.visibility = Some(visibility);
        Ok(())
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        let key = Self::key(path)?;
        let mut storage = self.storage.write().await;
        let mut entry = Self::replacement(storage.get(&key), path, content, &options.put_options());
        entry.expires_at = Some(expires_at);
        storage.insert(key, entry);
        Ok(())
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        let now = Utc::now();
        let mut storage = self.storage.write().await;
        let before = storage.len();
        storage.retain(|_, entry| {
            !(entry.metadata.path.starts_with(dir)
                && entry.expires_at.is_some_and(|at| is_expired(at, now)))
        });
        Ok(before - storage.len())
    }
}
