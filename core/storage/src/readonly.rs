//! Read-only wrapper driver.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    ByteStream, Capabilities, FileMetadata, PutOptions, StorageDriver, TemporaryUrlOptions,
    TimedOptions,
};

/// Rejects every mutating call with `Error::ReadOnly` before it reaches
/// the wrapped driver. Reads delegate unchanged.
pub struct ReadOnlyDriver {
    inner: Arc<dyn StorageDriver>,
}

impl ReadOnlyDriver {
    pub fn new(inner: Arc<dyn StorageDriver>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn StorageDriver> {
        &self.inner
    }

    fn reject<T>(&self, operation: &str, path: Option<&StoragePath>) -> Result<T> {
        debug!(backend = %self.inner.name(), operation, "Rejected write on read-only disk");
        Err(Error::ReadOnly(match path {
            Some(path) => format!("{} {} on a read-only disk", operation, path),
            None => format!("{} on a read-only disk", operation),
        }))
    }
}

#[async_trait]
impl StorageDriver for ReadOnlyDriver {
    fn name(&self) -> &str {
        "readonly"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            timed: false,
            native_append: false,
            streaming_upload: false,
            ..self.inner.capabilities()
        }
    }

    async fn put(&self, path: &StoragePath, _content: Bytes, _options: PutOptions) -> Result<()> {
        self.reject("put", Some(path))
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.reject("delete", Some(path))
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn copy(&self, _from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.reject("copy", Some(to))
    }

    async fn move_file(&self, from: &StoragePath, _to: &StoragePath) -> Result<()> {
        self.reject("move", Some(from))
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        self.inner.list_files(dir, recursive).await
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        self.inner.list_directories(dir, recursive).await
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        self.inner.read_stream(path).await
    }

    async fn prepend(&self, path: &StoragePath, _content: Bytes) -> Result<()> {
        self.reject("prepend", Some(path))
    }

    async fn append(&self, path: &StoragePath, _content: Bytes) -> Result<()> {
        self.reject("append", Some(path))
    }

    async fn put_stream(
        &self,
        path: &StoragePath,
        _stream: ByteStream,
        _options: PutOptions,
    ) -> Result<()> {
        self.reject("put_stream", Some(path))
    }

    async fn url(&self, path: &StoragePath) -> Result<String> {
        self.inner.url(path).await
    }

    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_in: Duration,
        options: TemporaryUrlOptions,
    ) -> Result<String> {
        self.inner.temporary_url(path, expires_in, options).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        self.inner.metadata(path).await
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        self.reject("make_directory", Some(path))
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        self.reject("delete_directory", Some(path))
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        self.inner.visibility(path).await
    }

    async fn set_visibility(&self, path: &StoragePath, _visibility: Visibility) -> Result<()> {
        self.reject("set_visibility", Some(path))
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        _content: Bytes,
        _options: TimedOptions,
    ) -> Result<()> {
        self.reject("put_timed", Some(path))
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.reject("delete_expired", Some(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDriver;
    use crate::driver::collect_stream;
    use stowage_common::ErrorKind;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    async fn seeded() -> (Arc<BufferDriver>, ReadOnlyDriver) {
        let inner = Arc::new(BufferDriver::new());
        inner
            .put(&p("a.txt"), Bytes::from("original"), PutOptions::default())
            .await
            .unwrap();
        let driver = ReadOnlyDriver::new(inner.clone());
        (inner, driver)
    }

    #[tokio::test]
    async fn test_mutations_rejected_without_touching_inner() {
        let (inner, driver) = seeded().await;
        let a = p("a.txt");
        let b = p("b.txt");

        let results = vec![
            driver.put(&b, Bytes::from("x"), PutOptions::default()).await,
            driver.delete(&a).await,
            driver.copy(&a, &b).await,
            driver.move_file(&a, &b).await,
            driver.append(&a, Bytes::from("x")).await,
            driver.prepend(&a, Bytes::from("x")).await,
            driver.make_directory(&p("dir")).await,
            driver.delete_directory(&p("dir")).await,
            driver.set_visibility(&a, Visibility::Public).await,
            driver
                .put_timed(&b, Bytes::from("x"), TimedOptions::ttl(Duration::ZERO))
                .await,
        ];
        for result in results {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::ReadOnlyViolation);
        }
        assert_eq!(
            driver.delete_expired().await.unwrap_err().kind(),
            ErrorKind::ReadOnlyViolation
        );

        assert_eq!(inner.len().await, 1);
        assert_eq!(inner.get(&a).await.unwrap(), Bytes::from("original"));
        assert_eq!(
            inner.visibility(&a).await.unwrap(),
            Visibility::Private
        );
    }

    #[tokio::test]
    async fn test_reads_match_inner() {
        let (inner, driver) = seeded().await;
        let a = p("a.txt");

        assert_eq!(driver.get(&a).await.unwrap(), inner.get(&a).await.unwrap());
        assert_eq!(driver.exists(&a).await.unwrap(), inner.exists(&a).await.unwrap());
        assert_eq!(
            driver.exists(&p("nope")).await.unwrap(),
            inner.exists(&p("nope")).await.unwrap()
        );
        assert_eq!(
            driver.list_files(&StoragePath::root(), true).await.unwrap(),
            inner.list_files(&StoragePath::root(), true).await.unwrap()
        );
        let streamed = collect_stream(driver.read_stream(&a).await.unwrap())
            .await
            .unwrap();
        assert_eq!(streamed, Bytes::from("original"));
    }

    #[tokio::test]
    async fn test_capabilities_hide_writes() {
        let (_inner, driver) = seeded().await;
        let caps = driver.capabilities();
        assert!(caps.metadata);
        assert!(!caps.timed);
        assert!(!caps.native_append);
    }
}
