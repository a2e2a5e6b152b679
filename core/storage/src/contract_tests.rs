//! Behaviour every full-contract driver shares, checked against the
//! in-process drivers and the wrappers around them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use stowage_common::{ErrorKind, Result, StoragePath, Visibility};

use crate::buffer::BufferDriver;
use crate::driver::{
    collect_stream, concat_existing, ByteStream, Capabilities, PutOptions, StorageDriver,
    TimedOptions,
};
use crate::expiration::{resolve_expiry, ExpirationIndex};
use crate::local::{LocalConfig, LocalDriver};
use crate::readonly::ReadOnlyDriver;
use crate::scoped::ScopedDriver;

fn p(s: &str) -> StoragePath {
    StoragePath::parse(s).unwrap()
}

async fn put(driver: &dyn StorageDriver, path: &str, content: &str) {
    driver
        .put(&p(path), Bytes::from(content.to_string()), PutOptions::default())
        .await
        .unwrap();
}

async fn check_round_trip(driver: &dyn StorageDriver) {
    put(driver, "text.txt", "hello world").await;
    assert_eq!(driver.get(&p("text.txt")).await.unwrap(), Bytes::from("hello world"));

    let binary: Vec<u8> = (0..=255u8).collect();
    driver
        .put(&p("nested/bin.dat"), Bytes::from(binary.clone()), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(driver.get(&p("nested/bin.dat")).await.unwrap(), Bytes::from(binary));

    put(driver, "text.txt", "replaced").await;
    assert_eq!(driver.get(&p("text.txt")).await.unwrap(), Bytes::from("replaced"));

    let streamed = collect_stream(driver.read_stream(&p("text.txt")).await.unwrap())
        .await
        .unwrap();
    assert_eq!(streamed, Bytes::from("replaced"));
}

async fn check_delete(driver: &dyn StorageDriver) {
    put(driver, "gone.txt", "x").await;
    driver.delete(&p("gone.txt")).await.unwrap();
    assert!(!driver.exists(&p("gone.txt")).await.unwrap());

    let err = driver.delete(&p("gone.txt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = driver.get(&p("gone.txt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

async fn check_copy_and_move(driver: &dyn StorageDriver) {
    put(driver, "a.txt", "payload").await;
    put(driver, "b.txt", "stale").await;

    driver.copy(&p("a.txt"), &p("b.txt")).await.unwrap();
    assert_eq!(driver.get(&p("b.txt")).await.unwrap(), Bytes::from("payload"));
    assert_eq!(driver.get(&p("a.txt")).await.unwrap(), Bytes::from("payload"));

    driver.move_file(&p("a.txt"), &p("moved/c.txt")).await.unwrap();
    assert!(!driver.exists(&p("a.txt")).await.unwrap());
    assert_eq!(driver.get(&p("moved/c.txt")).await.unwrap(), Bytes::from("payload"));

    let err = driver.copy(&p("missing"), &p("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

async fn check_append_prepend(driver: &dyn StorageDriver) {
    put(driver, "log.txt", "foo").await;
    driver.append(&p("log.txt"), Bytes::from("bar")).await.unwrap();
    assert_eq!(driver.get(&p("log.txt")).await.unwrap(), Bytes::from("foobar"));

    put(driver, "head.txt", "bar").await;
    driver.prepend(&p("head.txt"), Bytes::from("foo")).await.unwrap();
    assert_eq!(driver.get(&p("head.txt")).await.unwrap(), Bytes::from("foobar"));

    driver.append(&p("fresh.txt"), Bytes::from("new")).await.unwrap();
    assert_eq!(driver.get(&p("fresh.txt")).await.unwrap(), Bytes::from("new"));
}

async fn check_exists_idempotent(driver: &dyn StorageDriver) {
    put(driver, "stable.txt", "x").await;
    for _ in 0..3 {
        assert!(driver.exists(&p("stable.txt")).await.unwrap());
        assert!(!driver.exists(&p("never.txt")).await.unwrap());
    }
}

async fn check_listing(driver: &dyn StorageDriver) {
    put(driver, "list/one.txt", "1").await;
    put(driver, "list/two.txt", "2").await;
    put(driver, "list/deep/three.txt", "3").await;

    let shallow = driver.list_files(&p("list"), false).await.unwrap();
    assert_eq!(shallow, vec![p("one.txt"), p("two.txt")]);

    let deep = driver.list_files(&p("list"), true).await.unwrap();
    assert_eq!(deep, vec![p("deep/three.txt"), p("one.txt"), p("two.txt")]);
}

async fn check_timed(driver: &dyn StorageDriver) {
    driver
        .put_timed(&p("short.txt"), Bytes::from("s"), TimedOptions::ttl(Duration::ZERO))
        .await
        .unwrap();
    driver
        .put_timed(&p("long.txt"), Bytes::from("l"), TimedOptions::ttl(Duration::from_secs(3600)))
        .await
        .unwrap();

    assert_eq!(driver.delete_expired().await.unwrap(), 1);
    assert!(!driver.exists(&p("short.txt")).await.unwrap());
    assert!(driver.exists(&p("long.txt")).await.unwrap());
}

async fn put_expired(driver: &dyn StorageDriver, path: &str) {
    driver
        .put_timed(&p(path), Bytes::from("t"), TimedOptions::ttl(Duration::ZERO))
        .await
        .unwrap();
}

async fn check_expiry_follows_writes(driver: &dyn StorageDriver) {
    // A plain write after a timed one leaves an untimed object.
    put_expired(driver, "timed/reput.txt").await;
    driver.delete(&p("timed/reput.txt")).await.unwrap();
    put(driver, "timed/reput.txt", "plain").await;
    put_expired(driver, "timed/over.txt").await;
    put(driver, "timed/over.txt", "plain").await;
    assert_eq!(driver.delete_expired().await.unwrap(), 0);
    assert!(driver.exists(&p("timed/reput.txt")).await.unwrap());
    assert!(driver.exists(&p("timed/over.txt")).await.unwrap());

    put_expired(driver, "timed/app.txt").await;
    driver.append(&p("timed/app.txt"), Bytes::from("more")).await.unwrap();
    put_expired(driver, "timed/pre.txt").await;
    driver.prepend(&p("timed/pre.txt"), Bytes::from("more")).await.unwrap();
    assert_eq!(driver.delete_expired().await.unwrap(), 2);
    assert!(!driver.exists(&p("timed/app.txt")).await.unwrap());
    assert!(!driver.exists(&p("timed/pre.txt")).await.unwrap());

    // Copies start untimed; moves carry the expiry along.
    put_expired(driver, "timed/src.txt").await;
    driver.copy(&p("timed/src.txt"), &p("timed/copy.txt")).await.unwrap();
    driver.move_file(&p("timed/src.txt"), &p("timed/moved.txt")).await.unwrap();
    assert_eq!(driver.delete_expired().await.unwrap(), 1);
    assert!(driver.exists(&p("timed/copy.txt")).await.unwrap());
    assert!(!driver.exists(&p("timed/moved.txt")).await.unwrap());

    // Moving an untimed object over a timed one drops the old expiry.
    put_expired(driver, "timed/target.txt").await;
    driver.move_file(&p("timed/copy.txt"), &p("timed/target.txt")).await.unwrap();
    assert_eq!(driver.delete_expired().await.unwrap(), 0);
    assert!(driver.exists(&p("timed/target.txt")).await.unwrap());
}

async fn check_visibility_follows_writes(driver: &dyn StorageDriver) {
    if !driver.capabilities().visibility {
        return;
    }
    let path = p("shared/log.txt");
    driver
        .put(&path, Bytes::from("b"), PutOptions::with_visibility(Visibility::Public))
        .await
        .unwrap();
    driver.append(&path, Bytes::from("c")).await.unwrap();
    driver.prepend(&path, Bytes::from("a")).await.unwrap();
    assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Public);

    put(driver, "shared/log.txt", "rewritten").await;
    assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Public);

    driver.copy(&path, &p("shared/copy.txt")).await.unwrap();
    assert_eq!(driver.visibility(&p("shared/copy.txt")).await.unwrap(), Visibility::Public);
}

async fn check_contract(driver: &dyn StorageDriver) {
    check_round_trip(driver).await;
    check_delete(driver).await;
    check_copy_and_move(driver).await;
    check_append_prepend(driver).await;
    check_exists_idempotent(driver).await;
    check_listing(driver).await;
    check_timed(driver).await;
    check_expiry_follows_writes(driver).await;
    check_visibility_follows_writes(driver).await;
}

/// Keeps expirations in an index file the way the remote drivers do, with
/// an in-memory disk underneath.
struct IndexedDriver {
    raw: BufferDriver,
    expirations: ExpirationIndex,
}

impl IndexedDriver {
    fn new() -> Self {
        Self {
            raw: BufferDriver::new(),
            expirations: ExpirationIndex::for_backend("indexed"),
        }
    }
}

#[async_trait]
impl StorageDriver for IndexedDriver {
    fn name(&self) -> &str {
        "indexed"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            timed: true,
            ..Capabilities::default()
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, _options: PutOptions) -> Result<()> {
        self.raw.put(path, content, PutOptions::default()).await?;
        self.expirations.forget(self, path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        self.raw.get(path).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.raw.delete(path).await?;
        self.expirations.forget(self, path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.raw.exists(path).await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.raw.copy(from, to).await?;
        self.expirations.forget(self, to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.raw.move_file(from, to).await?;
        self.expirations.rename(self, from, to).await
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        let mut files = self.raw.list_files(dir, recursive).await?;
        if dir.is_root() {
            files.retain(|f| !self.expirations.is_index(f));
        }
        Ok(files)
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        self.raw.list_directories(dir, recursive).await
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        self.raw.read_stream(path).await
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.raw.put(path, data, PutOptions::default()).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.raw.put(path, data, PutOptions::default()).await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        self.raw.put(path, content, PutOptions::default()).await?;
        self.expirations.record(self, path, expires_at).await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.expirations.sweep(self, dir, Utc::now()).await
    }
}

#[tokio::test]
async fn index_backed_driver_honours_contract() {
    let driver = IndexedDriver::new();
    check_contract(&driver).await;

    let index = driver.raw.get(driver.expirations.file()).await.unwrap();
    let records: std::collections::BTreeMap<String, i64> = serde_json::from_slice(&index).unwrap();
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["long.txt"]);
}

#[tokio::test]
async fn scoped_index_backed_driver_honours_contract() {
    let inner = Arc::new(IndexedDriver::new());
    put_expired(inner.as_ref(), "elsewhere.txt").await;
    let driver = ScopedDriver::with_prefix(inner.clone(), "scope").unwrap();
    check_contract(&driver).await;

    assert!(inner.exists(&p("elsewhere.txt")).await.unwrap());
}

#[tokio::test]
async fn buffer_driver_honours_contract() {
    check_contract(&BufferDriver::new()).await;
}

#[tokio::test]
async fn local_driver_honours_contract() {
    let temp_dir = TempDir::new().unwrap();
    let driver = LocalDriver::new(LocalConfig::new(temp_dir.path())).unwrap();
    check_contract(&driver).await;
}

#[tokio::test]
async fn scoped_buffer_honours_contract() {
    let inner = Arc::new(BufferDriver::new());
    let driver = ScopedDriver::with_prefix(inner.clone(), "scope").unwrap();
    check_contract(&driver).await;

    assert!(!inner.exists(&p("stable.txt")).await.unwrap());
    assert!(inner.exists(&p("scope/stable.txt")).await.unwrap());
}

#[tokio::test]
async fn scoped_local_honours_contract() {
    let temp_dir = TempDir::new().unwrap();
    let inner = Arc::new(LocalDriver::new(LocalConfig::new(temp_dir.path())).unwrap());
    let driver = ScopedDriver::with_prefix(inner, "tenants/42").unwrap();
    check_contract(&driver).await;

    assert!(temp_dir.path().join("tenants/42/stable.txt").is_file());
}

#[tokio::test]
async fn read_only_reads_match_wrapped_driver() {
    let temp_dir = TempDir::new().unwrap();
    let inner = Arc::new(LocalDriver::new(LocalConfig::new(temp_dir.path())).unwrap());
    put(inner.as_ref(), "docs/a.txt", "alpha").await;
    put(inner.as_ref(), "docs/b.txt", "beta").await;
    let driver = ReadOnlyDriver::new(inner.clone());

    for path in ["docs/a.txt", "docs/b.txt"] {
        assert_eq!(driver.get(&p(path)).await.unwrap(), inner.get(&p(path)).await.unwrap());
    }
    assert_eq!(
        driver.list_files(&p("docs"), false).await.unwrap(),
        inner.list_files(&p("docs"), false).await.unwrap()
    );
    assert_eq!(
        driver.metadata(&p("docs/a.txt")).await.unwrap(),
        inner.metadata(&p("docs/a.txt")).await.unwrap()
    );

    let err = driver
        .put(&p("docs/a.txt"), Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnlyViolation);
    assert_eq!(inner.get(&p("docs/a.txt")).await.unwrap(), Bytes::from("alpha"));
}
