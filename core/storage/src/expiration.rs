//! Timed expiration records and the expired-object sweep.
//!
//! Expiry is always stored as an absolute instant in epoch milliseconds.
//! A relative TTL is resolved when the object is written, so a sweep gives
//! the same answer no matter when it runs relative to the write.
//!
//! Two storage layouts live here:
//! - a per-object JSON sidecar (`<object>.meta.json`), used by the local driver
//! - a centralized JSON index at the disk root mapping path to expiry,
//!   used by the remote protocol drivers

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stowage_common::{Error, Result, StoragePath};

use crate::driver::{PutOptions, StorageDriver, TimedOptions};

/// Suffix of per-object expiry sidecars.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Resolve the options of a timed write to an absolute expiry.
///
/// `expires_at` takes precedence over `ttl`.
pub fn resolve_expiry(options: &TimedOptions, now: DateTime<Utc>) -> Result<i64> {
    if let Some(at) = options.expires_at {
        return Ok(at.timestamp_millis());
    }
    if let Some(ttl) = options.ttl {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidInput(format!("TTL out of range: {}", e)))?;
        return Ok((now + ttl).timestamp_millis());
    }
    Err(Error::InvalidInput(
        "Timed write needs either a ttl or an expires_at".to_string(),
    ))
}

/// True when an object expiring at `expires_at` is due at `now`.
pub fn is_expired(expires_at: i64, now: DateTime<Utc>) -> bool {
    expires_at <= now.timestamp_millis()
}

/// Contents of a `<object>.meta.json` sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationRecord {
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl ExpirationRecord {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Path of the sidecar for `path`.
pub fn sidecar_path(path: &StoragePath) -> Result<StoragePath> {
    let name = path
        .name()
        .ok_or_else(|| Error::InvalidInput("Root has no sidecar".to_string()))?;
    let parent = path.parent().unwrap_or_default();
    parent.join(&format!("{}{}", name, SIDECAR_SUFFIX))
}

/// Path of the object a sidecar file name belongs to.
pub fn object_for_sidecar(sidecar: &StoragePath) -> Option<StoragePath> {
    let name = sidecar.name()?.strip_suffix(SIDECAR_SUFFIX)?;
    if name.is_empty() {
        return None;
    }
    sidecar.parent().unwrap_or_default().join(name).ok()
}

/// A centralized `path -> expiry` index stored as one JSON file at the
/// root of a disk.
///
/// Every `record` and `sweep` is a read-modify-write of that file. The
/// mutex makes it a critical section per driver instance; two processes
/// (or two driver instances) writing the same index still race with
/// last-write-wins.
pub struct ExpirationIndex {
    file: StoragePath,
    lock: Mutex<()>,
}

impl ExpirationIndex {
    /// Index named `.{backend}-expirations.json`.
    pub fn for_backend(backend: &str) -> Self {
        let file = StoragePath::root()
            .join(&format!(".{}-expirations.json", backend))
            .unwrap_or_default();
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    /// Where the index lives on the disk.
    pub fn file(&self) -> &StoragePath {
        &self.file
    }

    /// True for the index file itself, so listings can hide it.
    pub fn is_index(&self, path: &StoragePath) -> bool {
        path == &self.file
    }

    async fn load<D: StorageDriver + ?Sized>(&self, driver: &D) -> Result<BTreeMap<String, i64>> {
        match driver.get(&self.file).await {
            Ok(data) if data.is_empty() => Ok(BTreeMap::new()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn save<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        index: &BTreeMap<String, i64>,
    ) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        driver
            .put(&self.file, Bytes::from(data), PutOptions::default())
            .await
    }

    /// Record (or replace) the expiry of `path`.
    pub async fn record<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        path: &StoragePath,
        expires_at: i64,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load(driver).await?;
        index.insert(path.as_str(), expires_at);
        self.save(driver, &index).await?;
        debug!(path = %path, expires_at, index = %self.file, "Expiry recorded");
        Ok(())
    }

    /// Drop the record for `path`, if any.
    pub async fn forget<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        path: &StoragePath,
    ) -> Result<()> {
        if self.is_index(path) {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut index = self.load(driver).await?;
        if index.remove(&path.as_str()).is_some() {
            self.save(driver, &index).await?;
        }
        Ok(())
    }

    /// Drop the records of everything under `dir`.
    pub async fn forget_under<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        dir: &StoragePath,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load(driver).await?;
        let before = index.len();
        index.retain(|key, _| {
            StoragePath::parse(key).map_or(true, |path| !path.starts_with(dir))
        });
        if index.len() != before {
            self.save(driver, &index).await?;
        }
        Ok(())
    }

    /// Re-key the record of `from` to `to` after a move.
    ///
    /// Whatever `to` had is replaced; when `from` had no record, `to` ends
    /// up with none either.
    pub async fn rename<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        from: &StoragePath,
        to: &StoragePath,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load(driver).await?;
        let changed = match index.remove(&from.as_str()) {
            Some(at) => {
                index.insert(to.as_str(), at);
                true
            }
            None => index.remove(&to.as_str()).is_some(),
        };
        if changed {
            self.save(driver, &index).await?;
        }
        Ok(())
    }

    /// Expiry recorded for `path`.
    pub async fn expiry<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        path: &StoragePath,
    ) -> Result<Option<i64>> {
        let _guard = self.lock.lock().await;
        Ok(self.load(driver).await?.get(&path.as_str()).copied())
    }

    /// Delete every indexed object under `dir` due at `now`.
    ///
    /// The lock is not held across the deletes, since drivers drop index
    /// records from their own `delete`. Each entry is re-read right before
    /// its object goes, so a record forgotten by a concurrent overwrite is
    /// skipped. Objects already gone are dropped from the index without
    /// counting.
    pub async fn sweep<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        dir: &StoragePath,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let due: Vec<String> = {
            let _guard = self.lock.lock().await;
            self.load(driver)
                .await?
                .into_iter()
                .filter(|(_, at)| is_expired(*at, now))
                .map(|(path, _)| path)
                .filter(|key| StoragePath::parse(key).is_ok_and(|path| path.starts_with(dir)))
                .collect()
        };

        let mut deleted = 0;
        for key in due {
            let path = StoragePath::parse(&key)?;
            match self.expiry(driver, &path).await? {
                Some(at) if is_expired(at, now) => {}
                _ => continue,
            }
            match driver.delete(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {
                    warn!(path = %path, "Expired object already gone");
                }
                Err(e) => return Err(e),
            }
            self.forget(driver, &path).await?;
        }

        if deleted > 0 {
            info!(index = %self.file, deleted, "Expired objects swept");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDriver;
    use std::time::Duration;

    #[test]
    fn test_expires_at_wins_over_ttl() {
        let now = Utc::now();
        let at = now + chrono::Duration::days(2);
        let options = TimedOptions {
            ttl: Some(Duration::from_secs(10)),
            expires_at: Some(at),
            visibility: None,
        };
        assert_eq!(resolve_expiry(&options, now).unwrap(), at.timestamp_millis());
    }

    #[test]
    fn test_ttl_resolved_against_write_time() {
        let now = Utc::now();
        let options = TimedOptions::ttl(Duration::from_secs(60));
        assert_eq!(
            resolve_expiry(&options, now).unwrap(),
            now.timestamp_millis() + 60_000
        );
        assert!(resolve_expiry(&TimedOptions::default(), now).is_err());
    }

    #[test]
    fn test_is_expired_boundary() {
        let now = Utc::now();
        assert!(is_expired(now.timestamp_millis(), now));
        assert!(!is_expired(now.timestamp_millis() + 1, now));
    }

    #[test]
    fn test_sidecar_paths() {
        let path = StoragePath::parse("a/b.txt").unwrap();
        let sidecar = sidecar_path(&path).unwrap();
        assert_eq!(sidecar.as_str(), "a/b.txt.meta.json");
        assert_eq!(object_for_sidecar(&sidecar).unwrap(), path);
        assert!(object_for_sidecar(&StoragePath::parse(".meta.json").unwrap()).is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let record = ExpirationRecord { expires_at: 42 };
        assert_eq!(record.to_json().unwrap(), br#"{"expiresAt":42}"#.to_vec());
    }

    #[tokio::test]
    async fn test_index_sweep() {
        let driver = BufferDriver::new();
        let index = ExpirationIndex::for_backend("test");
        let now = Utc::now();
        let old = StoragePath::parse("old.txt").unwrap();
        let fresh = StoragePath::parse("fresh.txt").unwrap();
        let gone = StoragePath::parse("gone.txt").unwrap();

        for path in [&old, &fresh] {
            driver
                .put(path, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        index.record(&driver, &old, now.timestamp_millis() - 1).await.unwrap();
        index.record(&driver, &gone, now.timestamp_millis() - 1).await.unwrap();
        index
            .record(&driver, &fresh, now.timestamp_millis() + 60_000)
            .await
            .unwrap();

        assert_eq!(index.sweep(&driver, &StoragePath::root(), now).await.unwrap(), 1);
        assert!(!driver.exists(&old).await.unwrap());
        assert!(driver.exists(&fresh).await.unwrap());

        let saved: BTreeMap<String, i64> =
            serde_json::from_slice(&driver.get(index.file()).await.unwrap()).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved.contains_key("fresh.txt"));
    }

    #[tokio::test]
    async fn test_index_rename_and_forget_under() {
        let driver = BufferDriver::new();
        let index = ExpirationIndex::for_backend("test");
        let path = |s: &str| StoragePath::parse(s).unwrap();

        index.record(&driver, &path("a.txt"), 10).await.unwrap();
        index.record(&driver, &path("b.txt"), 20).await.unwrap();
        index.rename(&driver, &path("a.txt"), &path("b.txt")).await.unwrap();
        assert_eq!(index.expiry(&driver, &path("a.txt")).await.unwrap(), None);
        assert_eq!(index.expiry(&driver, &path("b.txt")).await.unwrap(), Some(10));

        // Moving an untimed object over a timed one clears the record.
        index.rename(&driver, &path("plain.txt"), &path("b.txt")).await.unwrap();
        assert_eq!(index.expiry(&driver, &path("b.txt")).await.unwrap(), None);

        index.record(&driver, &path("dir/x.txt"), 1).await.unwrap();
        index.record(&driver, &path("dir/sub/y.txt"), 1).await.unwrap();
        index.record(&driver, &path("dirt.txt"), 1).await.unwrap();
        index.forget_under(&driver, &path("dir")).await.unwrap();
        assert_eq!(index.expiry(&driver, &path("dir/x.txt")).await.unwrap(), None);
        assert_eq!(index.expiry(&driver, &path("dir/sub/y.txt")).await.unwrap(), None);
        assert_eq!(index.expiry(&driver, &path("dirt.txt")).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_index_sweep_under_dir() {
        let driver = BufferDriver::new();
        let index = ExpirationIndex::for_backend("test");
        let now = Utc::now();
        let inside = StoragePath::parse("a/old.txt").unwrap();
        let outside = StoragePath::parse("b/old.txt").unwrap();

        for path in [&inside, &outside] {
            driver
                .put(path, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
            index.record(&driver, path, now.timestamp_millis() - 1).await.unwrap();
        }

        let dir = StoragePath::parse("a").unwrap();
        assert_eq!(index.sweep(&driver, &dir, now).await.unwrap(), 1);
        assert!(!driver.exists(&inside).await.unwrap());
        assert!(driver.exists(&outside).await.unwrap());
        assert!(index.expiry(&driver, &outside).await.unwrap().is_some());
    }
}
