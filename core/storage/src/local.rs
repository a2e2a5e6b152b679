//! Local filesystem storage driver.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    concat_existing, guess_mime, join_url, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TemporaryUrlOptions, TimedOptions,
};
use crate::expiration::{
    is_expired, object_for_sidecar, resolve_expiry, sidecar_path, ExpirationRecord,
    SIDECAR_SUFFIX,
};
use crate::temporary::{LinkRequest, TemporaryLinkStore};

/// Prefix of in-flight write files; they are renamed over the target.
const TEMP_PREFIX: &str = ".stowage-";

/// Default base of temporary link URLs when none is configured.
pub const DEFAULT_TEMPORARY_URL_BASE: &str = "/storage/temporary";

/// Local driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory every path resolves under.
    pub root: PathBuf,
    /// Base URL for `url()`, e.g. a CDN in front of `root`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Base URL of the endpoint that serves temporary links.
    #[serde(default)]
    pub temporary_url_base: Option<String>,
}

impl LocalConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_url: None,
            temporary_url_base: None,
        }
    }
}

/// Local filesystem storage driver.
///
/// Visibility is simulated with file modes (0644 public, 0600 private).
/// Writes go to a hidden temporary sibling that is renamed over the target,
/// so a reader never observes a half-written file. `append` opens the file
/// in append mode instead. Timed objects carry a
/// `<object>.meta.json` sidecar.
pub struct LocalDriver {
    root: PathBuf,
    public_url: Option<String>,
    temporary_url_base: String,
    links: Arc<TemporaryLinkStore>,
}

impl LocalDriver {
    /// Create a local driver with its own temporary link table.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(config: LocalConfig) -> Result<Self> {
        Self::with_links(config, Arc::new(TemporaryLinkStore::new()))
    }

    /// Create a local driver issuing links into `links`.
    pub fn with_links(config: LocalConfig, links: Arc<TemporaryLinkStore>) -> Result<Self> {
        let root = config.root;

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            public_url: config.public_url,
            temporary_url_base: config
                .temporary_url_base
                .unwrap_or_else(|| DEFAULT_TEMPORARY_URL_BASE.to_string()),
            links,
        })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Link table backing `temporary_url`.
    pub fn temporary_links(&self) -> Arc<TemporaryLinkStore> {
        self.links.clone()
    }

    /// Validate a temporary link token presented by `request`.
    ///
    /// Returns the linked path, or `None` for any unknown, expired or
    /// mismatched token.
    pub async fn resolve_temporary_link(
        &self,
        token: &str,
        request: &LinkRequest,
    ) -> Option<StoragePath> {
        self.links.resolve(token, request).await
    }

    /// Convert a StoragePath to a filesystem path.
    fn to_fs_path(&self, path: &StoragePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn file_path(&self, path: &StoragePath) -> Result<PathBuf> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(self.to_fs_path(path))
    }

    /// Metadata of an existing regular file.
    async fn file_meta(&self, path: &StoragePath) -> Result<std::fs::Metadata> {
        let fs_path = self.file_path(path)?;
        let meta = fs::metadata(&fs_path)
            .await
            .map_err(|e| not_found(e, path))?;
        if meta.is_dir() {
            return Err(Error::InvalidInput(format!("Is a directory: {}", path)));
        }
        Ok(meta)
    }

    fn temp_sibling(target: &Path) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("Target has no parent directory".to_string()))?;
        Ok(parent.join(format!("{}{}.tmp", TEMP_PREFIX, Uuid::new_v4())))
    }

    /// Mode to give a rewritten file: the requested visibility, otherwise
    /// whatever the existing file had.
    async fn target_mode(target: &Path, visibility: Option<Visibility>) -> Option<u32> {
        if let Some(visibility) = visibility {
            return Some(visibility.file_mode());
        }
        current_mode(target).await
    }

    /// Write `data` to a temporary sibling, then rename it over `target`.
    async fn write_atomic(
        &self,
        target: &Path,
        data: &[u8],
        visibility: Option<Visibility>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mode = Self::target_mode(target, visibility).await;
        let tmp = Self::temp_sibling(target)?;

        let result: Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            if let Some(mode) = mode {
                set_mode(&tmp, mode).await?;
            }
            fs::rename(&tmp, target).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Stream chunks into a temporary sibling, then rename it over `target`.
    async fn write_stream_atomic(
        &self,
        target: &Path,
        mut stream: ByteStream,
        visibility: Option<Visibility>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mode = Self::target_mode(target, visibility).await;
        let tmp = Self::temp_sibling(target)?;

        let result: Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.sync_all().await?;
            drop(file);
            if let Some(mode) = mode {
                set_mode(&tmp, mode).await?;
            }
            fs::rename(&tmp, target).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Walk `dir`, returning (files, directories) relative to it.
    ///
    /// Temporary write files are skipped; sidecars only when
    /// `include_sidecars` is false.
    async fn walk(
        &self,
        dir: &StoragePath,
        recursive: bool,
        include_sidecars: bool,
    ) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
        let base = self.to_fs_path(dir);
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        match fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(Error::InvalidInput(format!("Not a directory: {}", dir))),
            Err(e) if is_missing(&e) => return Ok((files, dirs)),
            Err(e) => return Err(e.into()),
        }

        let mut pending = vec![StoragePath::root()];
        while let Some(relative) = pending.pop() {
            let mut entries = fs::read_dir(base.join(relative.as_str())).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    warn!(entry = ?entry.path(), "Skipping non UTF-8 file name");
                    continue;
                };
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let child = relative.join(&name)?;
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if recursive {
                        pending.push(child.clone());
                    }
                    dirs.push(child);
                } else if include_sidecars || !name.ends_with(SIDECAR_SUFFIX) {
                    files.push(child);
                }
            }
        }

        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }

    async fn remove_sidecar(&self, path: &StoragePath) -> Result<()> {
        let sidecar = self.to_fs_path(&sidecar_path(path)?);
        match fs::remove_file(&sidecar).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            public_url: self.public_url.is_some(),
            temporary_url: true,
            metadata: true,
            directories: true,
            visibility: cfg!(unix),
            timed: true,
            native_append: true,
            streaming_upload: true,
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        let fs_path = self.file_path(path)?;
        debug!(path = %path, size = content.len(), "Writing file");
        self.write_atomic(&fs_path, &content, options.visibility).await?;
        self.remove_sidecar(path).await
    }

    async fn put_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: PutOptions,
    ) -> Result<()> {
        let fs_path = self.file_path(path)?;
        debug!(path = %path, "Streaming file");
        self.write_stream_atomic(&fs_path, stream, options.visibility)
            .await?;
        self.remove_sidecar(path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        self.file_meta(path).await?;
        let data = fs::read(self.to_fs_path(path))
            .await
            .map_err(|e| not_found(e, path))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.file_meta(path).await?;
        fs::remove_file(self.to_fs_path(path))
            .await
            .map_err(|e| not_found(e, path))?;
        self.remove_sidecar(path).await?;
        debug!(path = %path, "File deleted");
        Ok(())
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match fs::try_exists(self.to_fs_path(path)).await {
            Ok(exists) => Ok(exists),
            // A file where a directory component should be.
            Err(e) if e.kind() == io::ErrorKind::NotADirectory => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.file_meta(from).await?;
        let from_path = self.to_fs_path(from);
        let to_path = self.file_path(to)?;

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = Self::temp_sibling(&to_path)?;
        let result: Result<()> = async {
            fs::copy(&from_path, &tmp)
                .await
                .map_err(|e| not_found(e, from))?;
            fs::rename(&tmp, &to_path).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result?;
        // A copy starts without an expiry.
        self.remove_sidecar(to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.file_meta(from).await?;
        let to_path = self.file_path(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.to_fs_path(from), &to_path)
            .await
            .map_err(|e| not_found(e, from))?;

        // The expiry travels with the object.
        let old_sidecar = self.to_fs_path(&sidecar_path(from)?);
        if fs::try_exists(&old_sidecar).await? {
            fs::rename(&old_sidecar, self.to_fs_path(&sidecar_path(to)?)).await?;
        } else {
            self.remove_sidecar(to).await?;
        }
        Ok(())
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        Ok(self.walk(dir, recursive, false).await?.0)
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        Ok(self.walk(dir, recursive, false).await?.1)
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        self.file_meta(path).await?;
        let file = fs::File::open(self.to_fs_path(path))
            .await
            .map_err(|e| not_found(e, path))?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.write_atomic(&self.file_path(path)?, &data, None).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let fs_path = self.file_path(path)?;
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&fs_path)
            .await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn url(&self, path: &StoragePath) -> Result<String> {
        match &self.public_url {
            Some(base) => Ok(join_url(base, path)),
            None => Err(Error::Unsupported(
                "url requires public_url on the local driver".to_string(),
            )),
        }
    }

    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_in: Duration,
        options: TemporaryUrlOptions,
    ) -> Result<String> {
        self.file_meta(path).await?;
        let token = self.links.issue(path, expires_in, options).await?;
        Ok(format!(
            "{}/{}",
            self.temporary_url_base.trim_end_matches('/'),
            token
        ))
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let meta = self.file_meta(path).await?;
        let last_modified: Option<DateTime<Utc>> = meta.modified().ok().map(|t| t.into());

        Ok(FileMetadata {
            path: path.clone(),
            size: meta.len(),
            mime_type: guess_mime(path),
            last_modified,
            visibility: mode_of(&meta).map(Visibility::from_file_mode),
        })
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        fs::create_dir_all(self.to_fs_path(path)).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        let fs_path = self.to_fs_path(path);
        let meta = fs::metadata(&fs_path)
            .await
            .map_err(|e| not_found(e, path))?;
        if !meta.is_dir() {
            return Err(Error::InvalidInput(format!("Not a directory: {}", path)));
        }
        fs::remove_dir_all(&fs_path).await?;
        debug!(path = %path, "Directory deleted");
        Ok(())
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        let meta = self.file_meta(path).await?;
        mode_of(&meta)
            .map(Visibility::from_file_mode)
            .ok_or_else(|| Error::unsupported("local", "visibility"))
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        self.file_meta(path).await?;
        set_mode(&self.to_fs_path(path), visibility.file_mode()).await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        self.put(path, content, options.put_options()).await?;

        let record = ExpirationRecord { expires_at };
        let sidecar = self.to_fs_path(&sidecar_path(path)?);
        self.write_atomic(&sidecar, &record.to_json()?, None).await?;
        debug!(path = %path, expires_at, "Timed file written");
        Ok(())
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        let now = Utc::now();
        let (files, _) = self.walk(dir, true, true).await?;
        let mut deleted = 0;

        for relative in files.iter().filter(|f| f.as_str().ends_with(SIDECAR_SUFFIX)) {
            let sidecar = &dir.join_path(relative);
            let Some(object) = object_for_sidecar(sidecar) else {
                continue;
            };
            let sidecar_fs = self.to_fs_path(sidecar);
            let record = match fs::read(&sidecar_fs).await {
                Ok(data) => match ExpirationRecord::from_json(&data) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(sidecar = %sidecar, error = %e, "Skipping unreadable expiry sidecar");
                        continue;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if !is_expired(record.expires_at, now) {
                continue;
            }

            match fs::remove_file(self.to_fs_path(&object)).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.remove_sidecar(&object).await?;
        }

        info!(root = ?self.root, dir = %dir, deleted, "Expired files swept");
        Ok(deleted)
    }
}

/// Absent, or a regular file sits where a parent directory should be.
fn is_missing(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

fn not_found(e: io::Error, path: &StoragePath) -> Error {
    if is_missing(&e) {
        Error::NotFound(format!("File not found: {}", path))
    } else {
        Error::Io(e)
    }
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode())
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

async fn current_mode(path: &Path) -> Option<u32> {
    match fs::metadata(path).await {
        Ok(meta) => mode_of(&meta),
        Err(_) => None,
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Err(Error::unsupported("local", "set_visibility"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::collect_stream;
    use tempfile::TempDir;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    fn driver(temp: &TempDir) -> LocalDriver {
        LocalDriver::new(LocalConfig::new(temp.path())).unwrap()
    }

    #[tokio::test]
    async fn test_local_put_creates_directories() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        driver
            .put(&p("a/b/c.txt"), Bytes::from("Hello, Local!"), PutOptions::default())
            .await
            .unwrap();

        assert!(temp.path().join("a/b/c.txt").is_file());
        assert_eq!(driver.get(&p("a/b/c.txt")).await.unwrap(), Bytes::from("Hello, Local!"));
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        assert!(driver.get(&p("nope.txt")).await.unwrap_err().is_not_found());
        assert!(driver.delete(&p("nope.txt")).await.unwrap_err().is_not_found());
        assert!(driver
            .copy(&p("nope.txt"), &p("x.txt"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(driver.read_stream(&p("nope.txt")).await.err().unwrap().is_not_found());
        assert!(!driver.exists(&p("nope.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_path_below_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        driver.put(&p("a.txt"), Bytes::from("a"), PutOptions::default()).await.unwrap();

        assert!(!driver.exists(&p("a.txt/b")).await.unwrap());
        assert!(driver.get(&p("a.txt/b")).await.unwrap_err().is_not_found());
        assert!(driver.metadata(&p("a.txt/b")).await.unwrap_err().is_not_found());
        assert!(driver.delete(&p("a.txt/b")).await.unwrap_err().is_not_found());
        assert!(driver.list_files(&p("a.txt/b"), false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_listing_hides_internal_files() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        driver.put(&p("dir/one.txt"), Bytes::from("1"), PutOptions::default()).await.unwrap();
        driver
            .put_timed(
                &p("dir/sub/two.txt"),
                Bytes::from("2"),
                TimedOptions::ttl(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        std::fs::write(temp.path().join("dir/.stowage-leftover.tmp"), b"x").unwrap();

        assert_eq!(driver.list_files(&p("dir"), false).await.unwrap(), vec![p("one.txt")]);
        assert_eq!(
            driver.list_files(&p("dir"), true).await.unwrap(),
            vec![p("one.txt"), p("sub/two.txt")]
        );
        assert_eq!(driver.list_directories(&p(""), true).await.unwrap(), vec![p("dir"), p("dir/sub")]);
        assert_eq!(driver.list_directories(&p(""), false).await.unwrap(), vec![p("dir")]);
        assert!(driver.list_files(&p("missing"), true).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_visibility_modes() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        let path = p("secret.txt");

        driver
            .put(&path, Bytes::from("x"), PutOptions::with_visibility(Visibility::Private))
            .await
            .unwrap();
        let mode = std::fs::metadata(temp.path().join("secret.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Private);

        driver.set_visibility(&path, Visibility::Public).await.unwrap();
        assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Public);

        // Overwriting without a visibility keeps the current mode.
        driver.put(&path, Bytes::from("y"), PutOptions::default()).await.unwrap();
        assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Public);

        // Modes matching neither read as private.
        std::fs::set_permissions(
            temp.path().join("secret.txt"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        assert_eq!(driver.visibility(&path).await.unwrap(), Visibility::Private);
    }

    #[tokio::test]
    async fn test_local_stream_roundtrip() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        let chunks: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("chunk-1;")),
            Ok(Bytes::from("chunk-2")),
        ]));

        driver.put_stream(&p("s.bin"), chunks, PutOptions::default()).await.unwrap();
        let stream = driver.read_stream(&p("s.bin")).await.unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), Bytes::from("chunk-1;chunk-2"));
    }

    #[tokio::test]
    async fn test_local_failed_stream_leaves_prior_content() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        driver.put(&p("f.txt"), Bytes::from("old"), PutOptions::default()).await.unwrap();

        let chunks: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("new")),
            Err(Error::Transport("client went away".to_string())),
        ]));
        assert!(driver.put_stream(&p("f.txt"), chunks, PutOptions::default()).await.is_err());

        assert_eq!(driver.get(&p("f.txt")).await.unwrap(), Bytes::from("old"));
        assert_eq!(driver.list_files(&p(""), false).await.unwrap(), vec![p("f.txt")]);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_local_metadata() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        driver.put(&p("doc.json"), Bytes::from("{}"), PutOptions::default()).await.unwrap();

        let meta = driver.metadata(&p("doc.json")).await.unwrap();
        assert_eq!(meta.size, 2);
        assert_eq!(meta.mime_type.as_deref(), Some("application/json"));
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_local_urls() {
        let temp = TempDir::new().unwrap();
        let mut config = LocalConfig::new(temp.path());
        config.public_url = Some("https://cdn.example.com/files".to_string());
        config.temporary_url_base = Some("https://app.example.com/t/".to_string());
        let driver = LocalDriver::new(config).unwrap();
        driver.put(&p("a b.txt"), Bytes::from("x"), PutOptions::default()).await.unwrap();

        assert_eq!(
            driver.url(&p("a b.txt")).await.unwrap(),
            "https://cdn.example.com/files/a%20b.txt"
        );

        let url = driver
            .temporary_url(&p("a b.txt"), Duration::from_secs(60), Default::default())
            .await
            .unwrap();
        let token = url.strip_prefix("https://app.example.com/t/").unwrap();
        assert_eq!(
            driver.resolve_temporary_link(token, &LinkRequest::default()).await,
            Some(p("a b.txt"))
        );
    }

    #[tokio::test]
    async fn test_local_url_requires_public_url() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        let err = driver.url(&p("a.txt")).await.unwrap_err();
        assert_eq!(err.kind(), stowage_common::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_local_temporary_url_expires() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        driver.put(&p("a.txt"), Bytes::from("x"), PutOptions::default()).await.unwrap();

        let url = driver
            .temporary_url(&p("a.txt"), Duration::from_secs(1), Default::default())
            .await
            .unwrap();
        let token = url.rsplit('/').next().unwrap().to_string();

        assert_eq!(
            driver.resolve_temporary_link(&token, &LinkRequest::default()).await,
            Some(p("a.txt"))
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            driver.resolve_temporary_link(&token, &LinkRequest::default()).await,
            None
        );
    }

    #[tokio::test]
    async fn test_local_temporary_url_ip_binding() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);
        driver.put(&p("a.txt"), Bytes::from("x"), PutOptions::default()).await.unwrap();
        let ip: std::net::IpAddr = "192.168.1.20".parse().unwrap();

        let url = driver
            .temporary_url(
                &p("a.txt"),
                Duration::from_secs(60),
                TemporaryUrlOptions {
                    ip: Some(ip),
                    device_id: None,
                },
            )
            .await
            .unwrap();
        let token = url.rsplit('/').next().unwrap().to_string();

        assert!(driver
            .resolve_temporary_link(&token, &LinkRequest::from_ip(ip))
            .await
            .is_some());
        assert!(driver
            .resolve_temporary_link(&token, &LinkRequest::from_ip("192.168.1.21".parse().unwrap()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_local_timed_sweep() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        driver
            .put_timed(&p("tmp/now.txt"), Bytes::from("x"), TimedOptions::ttl(Duration::ZERO))
            .await
            .unwrap();
        driver
            .put_timed(
                &p("tmp/later.txt"),
                Bytes::from("x"),
                TimedOptions::ttl(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        let sidecar: ExpirationRecord = serde_json::from_slice(
            &std::fs::read(temp.path().join("tmp/later.txt.meta.json")).unwrap(),
        )
        .unwrap();
        assert!(sidecar.expires_at > Utc::now().timestamp_millis());

        assert_eq!(driver.delete_expired().await.unwrap(), 1);
        assert!(!driver.exists(&p("tmp/now.txt")).await.unwrap());
        assert!(!temp.path().join("tmp/now.txt.meta.json").exists());
        assert!(driver.exists(&p("tmp/later.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_move_carries_expiry() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        driver
            .put_timed(&p("a.txt"), Bytes::from("x"), TimedOptions::ttl(Duration::ZERO))
            .await
            .unwrap();
        driver.move_file(&p("a.txt"), &p("moved/b.txt")).await.unwrap();

        assert!(temp.path().join("moved/b.txt.meta.json").exists());
        assert_eq!(driver.delete_expired().await.unwrap(), 1);
        assert!(!driver.exists(&p("moved/b.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_directories() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp);

        driver.make_directory(&p("x/y")).await.unwrap();
        assert!(temp.path().join("x/y").is_dir());
        driver.put(&p("x/y/f.txt"), Bytes::from("x"), PutOptions::default()).await.unwrap();

        driver.delete_directory(&p("x")).await.unwrap();
        assert!(!temp.path().join("x").exists());
        assert!(driver.delete_directory(&p("x")).await.unwrap_err().is_not_found());
        assert!(driver.delete_directory(&p("")).await.is_err());
    }
}
