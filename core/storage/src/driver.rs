//! Storage driver trait definition.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use stowage_common::{Error, Result, StoragePath, Visibility};

/// Metadata for a stored object.
///
/// Built fresh from the backend on every query; nothing caches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Logical path within the disk.
    pub path: StoragePath,
    /// Size in bytes.
    pub size: u64,
    /// MIME type, when the backend reports one or it can be guessed.
    pub mime_type: Option<String>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Public/private, when the backend tracks it.
    pub visibility: Option<Visibility>,
}

/// Options for `put` and `put_stream`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Visibility applied at write time where supported.
    pub visibility: Option<Visibility>,
    /// Explicit content type; backends guess from the extension otherwise.
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn with_visibility(visibility: Visibility) -> Self {
        Self {
            visibility: Some(visibility),
            ..Self::default()
        }
    }
}

/// Options for `put_timed`.
///
/// When both are set, `expires_at` wins over `ttl`.
#[derive(Debug, Clone, Default)]
pub struct TimedOptions {
    /// Relative lifetime, resolved to an absolute instant at write time.
    pub ttl: Option<Duration>,
    /// Absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub visibility: Option<Visibility>,
}

impl TimedOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn expires_at(at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(at),
            ..Self::default()
        }
    }

    pub(crate) fn put_options(&self) -> PutOptions {
        PutOptions {
            visibility: self.visibility,
            content_type: None,
        }
    }
}

/// Constraints bound into a temporary URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemporaryUrlOptions {
    /// Only requests from this address may use the link.
    pub ip: Option<IpAddr>,
    /// Only requests carrying this device id may use the link.
    pub device_id: Option<String>,
}

impl TemporaryUrlOptions {
    pub fn is_constrained(&self) -> bool {
        self.ip.is_some() || self.device_id.is_some()
    }
}

/// Default lifetime of temporary URLs.
pub const DEFAULT_TEMPORARY_URL_TTL: Duration = Duration::from_secs(3600);

/// What a driver can do beyond the mandatory operations.
///
/// Calling an optional operation the driver lacks returns
/// `Error::Unsupported`; this struct lets callers check up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub public_url: bool,
    pub temporary_url: bool,
    pub metadata: bool,
    pub directories: bool,
    pub visibility: bool,
    pub timed: bool,
    /// Append without re-reading the whole object.
    pub native_append: bool,
    /// `put_stream` uploads with bounded memory instead of buffering.
    pub streaming_upload: bool,
}

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Storage driver trait implemented by every backend and wrapper.
///
/// All operations are async. No ordering is guaranteed between concurrent
/// calls on the same path: two `put`s race and the last to complete wins,
/// and on backends without native append two concurrent `append`/`prepend`
/// calls can lose one writer's update. Existence checks done internally
/// before another operation are not atomic with it.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver tag (e.g. "local", "s3", "scoped").
    fn name(&self) -> &str;

    /// Optional operations this driver implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Write `content` to `path`, replacing any existing object.
    ///
    /// Missing parent directories are created on backends that have them.
    /// The object is either fully written or left in its prior state.
    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()>;

    /// Read the full content at `path`.
    ///
    /// # Errors
    /// - `NotFound` if absent
    async fn get(&self, path: &StoragePath) -> Result<Bytes>;

    /// Remove the object at `path`.
    ///
    /// # Errors
    /// - `NotFound` if absent (every built-in driver reports it)
    async fn delete(&self, path: &StoragePath) -> Result<()>;

    /// Check presence. Never returns `NotFound`; transport and auth
    /// failures still propagate.
    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// Copy `from` to `to`, overwriting `to`.
    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Move `from` to `to`, overwriting `to`.
    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Files under `dir`, relative to `dir`, sorted.
    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>>;

    /// Directories under `dir`, relative to `dir`, sorted.
    async fn list_directories(&self, dir: &StoragePath, recursive: bool)
        -> Result<Vec<StoragePath>>;

    /// Open a single-pass stream over the content at `path`.
    ///
    /// Network drivers may report a failure from the stream itself after
    /// this returns.
    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream>;

    /// Insert `content` before the existing content. A missing file is
    /// treated as empty.
    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()>;

    /// Add `content` after the existing content. A missing file is treated
    /// as empty.
    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()>;

    /// Write a stream to `path`.
    ///
    /// The default implementation buffers the whole stream in memory and
    /// calls `put`.
    async fn put_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: PutOptions,
    ) -> Result<()> {
        let content = collect_stream(stream).await?;
        self.put(path, content, options).await
    }

    /// Durable public URL for `path`.
    async fn url(&self, _path: &StoragePath) -> Result<String> {
        Err(Error::unsupported(self.name(), "url"))
    }

    /// Time-limited URL for `path`.
    async fn temporary_url(
        &self,
        _path: &StoragePath,
        _expires_in: Duration,
        _options: TemporaryUrlOptions,
    ) -> Result<String> {
        Err(Error::unsupported(self.name(), "temporary_url"))
    }

    async fn metadata(&self, _path: &StoragePath) -> Result<FileMetadata> {
        Err(Error::unsupported(self.name(), "metadata"))
    }

    async fn make_directory(&self, _path: &StoragePath) -> Result<()> {
        Err(Error::unsupported(self.name(), "make_directory"))
    }

    async fn delete_directory(&self, _path: &StoragePath) -> Result<()> {
        Err(Error::unsupported(self.name(), "delete_directory"))
    }

    async fn visibility(&self, _path: &StoragePath) -> Result<Visibility> {
        Err(Error::unsupported(self.name(), "visibility"))
    }

    async fn set_visibility(&self, _path: &StoragePath, _visibility: Visibility) -> Result<()> {
        Err(Error::unsupported(self.name(), "set_visibility"))
    }

    /// Write `content` and record an absolute expiry for it.
    async fn put_timed(
        &self,
        _path: &StoragePath,
        _content: Bytes,
        _options: TimedOptions,
    ) -> Result<()> {
        Err(Error::unsupported(self.name(), "put_timed"))
    }

    /// Delete every object whose expiry is at or before now.
    ///
    /// Returns how many objects were deleted. Runs only when called.
    async fn delete_expired(&self) -> Result<usize> {
        self.delete_expired_under(&StoragePath::root()).await
    }

    /// `delete_expired` limited to objects under `dir`.
    async fn delete_expired_under(&self, _dir: &StoragePath) -> Result<usize> {
        Err(Error::unsupported(self.name(), "delete_expired"))
    }
}

/// Drain a stream into one buffer.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Wrap an in-memory buffer as a one-chunk stream.
pub fn once_stream(content: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(content) }))
}

/// Read-modify-write used by drivers without native append/prepend.
///
/// Reads the current content (missing reads as empty) and returns the
/// concatenation. Not atomic: a concurrent writer between the read and the
/// caller's `put` is lost.
pub async fn concat_existing<D: StorageDriver + ?Sized>(
    driver: &D,
    path: &StoragePath,
    content: &[u8],
    at_front: bool,
) -> Result<Bytes> {
    let existing = match driver.get(path).await {
        Ok(existing) => existing,
        Err(e) if e.is_not_found() => Bytes::new(),
        Err(e) => return Err(e),
    };

    let mut buffer = BytesMut::with_capacity(existing.len() + content.len());
    if at_front {
        buffer.extend_from_slice(content);
        buffer.extend_from_slice(&existing);
    } else {
        buffer.extend_from_slice(&existing);
        buffer.extend_from_slice(content);
    }
    Ok(buffer.freeze())
}

/// Turn a `NotFound` into `false` for `exists` implementations.
pub fn exists_from<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Characters escaped when a path is embedded in a URL.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode each component and join with `/`.
pub fn encode_path(path: &StoragePath) -> String {
    path.components()
        .iter()
        .map(|c| utf8_percent_encode(c, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a base URL and a path.
pub fn join_url(base: &str, path: &StoragePath) -> String {
    format!("{}/{}", base.trim_end_matches('/'), encode_path(path))
}

/// Guess a MIME type from the path's extension.
pub fn guess_mime(path: &StoragePath) -> Option<String> {
    path.name()
        .and_then(|name| mime_guess::from_path(name).first())
        .map(|mime| mime.essence_str().to_string())
}
