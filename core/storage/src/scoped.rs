//! Prefix-scoping wrapper driver.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use stowage_common::{Result, StoragePath, Visibility};

use crate::driver::{
    ByteStream, Capabilities, FileMetadata, PutOptions, StorageDriver, TemporaryUrlOptions,
    TimedOptions,
};

/// Restricts every operation to paths under a fixed prefix of another
/// driver.
///
/// Callers address paths relative to the prefix; listings and metadata are
/// reported relative to it as well. Errors from the wrapped driver pass
/// through unchanged. Sweeps of expired objects stay inside the prefix too.
pub struct ScopedDriver {
    inner: Arc<dyn StorageDriver>,
    prefix: StoragePath,
}

impl ScopedDriver {
    pub fn new(inner: Arc<dyn StorageDriver>, prefix: StoragePath) -> Self {
        Self { inner, prefix }
    }

    /// Parse `prefix` and wrap `inner`.
    pub fn with_prefix(inner: Arc<dyn StorageDriver>, prefix: &str) -> Result<Self> {
        Ok(Self::new(inner, StoragePath::parse(prefix)?))
    }

    pub fn prefix(&self) -> &StoragePath {
        &self.prefix
    }

    pub fn inner(&self) -> &Arc<dyn StorageDriver> {
        &self.inner
    }

    fn scoped(&self, path: &StoragePath) -> StoragePath {
        self.prefix.join_path(path)
    }
}

#[async_trait]
impl StorageDriver for ScopedDriver {
    fn name(&self) -> &str {
        "scoped"
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        self.inner.put(&self.scoped(path), content, options).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        self.inner.get(&self.scoped(path)).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.inner.delete(&self.scoped(path)).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.inner.exists(&self.scoped(path)).await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.inner.copy(&self.scoped(from), &self.scoped(to)).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.inner
            .move_file(&self.scoped(from), &self.scoped(to))
            .await
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        self.inner.list_files(&self.scoped(dir), recursive).await
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        self.inner.list_directories(&self.scoped(dir), recursive).await
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        self.inner.read_stream(&self.scoped(path)).await
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        self.inner.prepend(&self.scoped(path), content).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        self.inner.append(&self.scoped(path), content).await
    }

    async fn put_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: PutOptions,
    ) -> Result<()> {
        self.inner.put_stream(&self.scoped(path), stream, options).await
    }

    async fn url(&self, path: &StoragePath) -> Result<String> {
        self.inner.url(&self.scoped(path)).await
    }

    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_in: Duration,
        options: TemporaryUrlOptions,
    ) -> Result<String> {
        self.inner
            .temporary_url(&self.scoped(path), expires_in, options)
            .await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let mut metadata = self.inner.metadata(&self.scoped(path)).await?;
        metadata.path = path.clone();
        Ok(metadata)
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        self.inner.make_directory(&self.scoped(path)).await
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        self.inner.delete_directory(&self.scoped(path)).await
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        self.inner.visibility(&self.scoped(path)).await
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        self.inner
            .set_visibility(&self.scoped(path), visibility)
            .await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        self.inner
            .put_timed(&self.scoped(path), content, options)
            .await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.inner.delete_expired_under(&self.prefix.join_path(dir)).await
    }
}
