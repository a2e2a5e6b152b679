//! FTP storage driver.
//!
//! `suppaftp` is a blocking client, so every operation runs inside
//! `spawn_blocking` on a session of its own: connect, log in, switch to
//! binary mode and the configured root, do the work, quit.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, warn};
use uuid::Uuid;

use stowage_common::{Error, Result, StoragePath};

use crate::driver::{
    concat_existing, guess_mime, once_stream, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TimedOptions,
};
use crate::expiration::{resolve_expiry, ExpirationIndex};

fn default_port() -> u16 {
    21
}

fn default_username() -> String {
    "anonymous".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// FTP driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Server directory every path resolves under.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl FtpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: default_username(),
            password: String::new(),
            root: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// FTP storage driver.
pub struct FtpDriver {
    config: Arc<FtpConfig>,
    expirations: ExpirationIndex,
}

impl FtpDriver {
    pub fn new(config: FtpConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(Error::InvalidInput("FTP host is empty".to_string()));
        }
        Ok(Self {
            config: Arc::new(config),
            expirations: ExpirationIndex::for_backend("ftp"),
        })
    }

    /// Run `op` on a fresh session. The session is closed whatever `op`
    /// returns.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = connect(&config)?;
            let result = op(&mut ftp);
            if let Err(e) = ftp.quit() {
                warn!(host = %config.host, error = %e, "FTP quit failed");
            }
            result
        })
        .await
        .map_err(|e| Error::Transport(format!("FTP task failed: {}", e)))?
    }

    fn remote(path: &StoragePath) -> Result<String> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(path.as_str())
    }

    /// Upload `content` over `path`, leaving any expiry record alone.
    async fn write(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let path = path.clone();
        debug!(path = %path, size = content.len(), "FTP upload");
        self.with_session(move |ftp| store(ftp, &path, &content)).await
    }

    async fn walk(&self, dir: &StoragePath, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
        let dir = dir.clone();
        let hide_index = dir.is_root();
        let index = self.expirations.file().clone();
        let (mut files, mut dirs) = self
            .with_session(move |ftp| walk_tree(ftp, &dir, recursive))
            .await?;
        if hide_index {
            files.retain(|f| f != &index);
        }
        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }
}

fn connect(config: &FtpConfig) -> Result<FtpStream> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| Error::Transport(format!("Cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| Error::Transport(format!("No address for {}", config.host)))?;

    let mut ftp = FtpStream::connect_timeout(addr, timeout)
        .map_err(|e| Error::Transport(format!("FTP connect to {} failed: {}", config.host, e)))?;

    let setup = (|| -> Result<()> {
        ftp.login(&config.username, &config.password)
            .map_err(|e| match e {
                FtpError::UnexpectedResponse(_) => {
                    Error::Authentication(format!("FTP login failed for {}", config.username))
                }
                other => ftp_error(other, "login"),
            })?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| ftp_error(e, "TYPE I"))?;
        if let Some(root) = config.root.as_deref().filter(|r| !r.is_empty()) {
            ftp.cwd(root).map_err(|e| ftp_error(e, root))?;
        }
        Ok(())
    })();

    if let Err(e) = setup {
        let _ = ftp.quit();
        return Err(e);
    }
    debug!(host = %config.host, "FTP session opened");
    Ok(ftp)
}

fn ftp_error(err: FtpError, path: &str) -> Error {
    match err {
        FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable => {
            Error::NotFound(format!("File not found: {}", path))
        }
        FtpError::UnexpectedResponse(response) if response.status == Status::NotLoggedIn => {
            Error::Authentication("FTP session is not logged in".to_string())
        }
        FtpError::ConnectionError(e) => Error::Transport(format!("FTP connection error: {}", e)),
        other => Error::Transport(format!("FTP error on {}: {}", path, other)),
    }
}

/// Create `dir` and every missing ancestor.
fn mkdir_all(ftp: &mut FtpStream, dir: &StoragePath) -> Result<()> {
    let mut current = StoragePath::root();
    for component in dir.components() {
        current = current.join(component)?;
        let remote = current.as_str();
        match ftp.mkdir(&remote) {
            Ok(()) => {}
            // Already there (or a file in the way, which the next step reports).
            Err(FtpError::UnexpectedResponse(_)) => {}
            Err(e) => return Err(ftp_error(e, &remote)),
        }
    }
    Ok(())
}

/// Upload to a temporary sibling, then rename over `path`.
fn store(ftp: &mut FtpStream, path: &StoragePath, content: &[u8]) -> Result<()> {
    let target = FtpDriver::remote(path)?;
    let parent = path.parent().unwrap_or_default();
    mkdir_all(ftp, &parent)?;

    let tmp = parent
        .join(&format!(".stowage-{}.tmp", Uuid::new_v4()))?
        .as_str();
    let mut reader = Cursor::new(content);
    if let Err(e) = ftp.put_file(&tmp, &mut reader) {
        let _ = ftp.rm(&tmp);
        return Err(ftp_error(e, &target));
    }

    if ftp.rename(&tmp, &target).is_err() {
        // Some servers refuse to rename over an existing file.
        let _ = ftp.rm(&target);
        if let Err(e) = ftp.rename(&tmp, &target) {
            let _ = ftp.rm(&tmp);
            return Err(ftp_error(e, &target));
        }
    }
    Ok(())
}

fn fetch(ftp: &mut FtpStream, path: &StoragePath) -> Result<Bytes> {
    let remote = FtpDriver::remote(path)?;
    let cursor = ftp.retr_as_buffer(&remote).map_err(|e| ftp_error(e, &remote))?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Parse `LIST` output into (name, is_directory) pairs, skipping `.`/`..`
/// and lines no known format matches.
pub fn parse_listing(lines: &[String]) -> Vec<(String, bool)> {
    lines
        .iter()
        .filter_map(|line| match ListEntry::from_str(line) {
            Ok(entry) => Some(entry),
            Err(_) => {
                debug!(line = %line, "Skipping unparseable LIST line");
                None
            }
        })
        .filter(|entry| entry.name() != "." && entry.name() != "..")
        .map(|entry| (entry.name().to_string(), entry.is_directory()))
        .collect()
}

fn list_dir(ftp: &mut FtpStream, dir: &StoragePath) -> Result<Option<Vec<(String, bool)>>> {
    let remote = dir.as_str();
    let target = if remote.is_empty() { None } else { Some(remote.as_str()) };
    match ftp.list(target) {
        Ok(lines) => Ok(Some(parse_listing(&lines))),
        Err(FtpError::UnexpectedResponse(r)) if r.status == Status::FileUnavailable => Ok(None),
        Err(e) => Err(ftp_error(e, &remote)),
    }
}

/// Files and directories under `dir`, relative to it.
fn walk_tree(ftp: &mut FtpStream, dir: &StoragePath, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![StoragePath::root()];

    while let Some(relative) = pending.pop() {
        let Some(entries) = list_dir(ftp, &dir.join_path(&relative))? else {
            continue;
        };
        for (name, is_dir) in entries {
            if name.starts_with(".stowage-") {
                continue;
            }
            let child = relative.join(&name)?;
            if is_dir {
                if recursive {
                    pending.push(child.clone());
                }
                dirs.push(child);
            } else {
                files.push(child);
            }
        }
    }
    Ok((files, dirs))
}

#[async_trait]
impl StorageDriver for FtpDriver {
    fn name(&self) -> &str {
        "ftp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata: true,
            directories: true,
            timed: true,
            ..Capabilities::default()
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, _options: PutOptions) -> Result<()> {
        self.write(path, content).await?;
        self.expirations.forget(self, path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let path = path.clone();
        self.with_session(move |ftp| fetch(ftp, &path)).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let remote = Self::remote(path)?;
        self.with_session(move |ftp| ftp.rm(&remote).map_err(|e| ftp_error(e, &remote)))
            .await?;
        self.expirations.forget(self, path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        let remote = Self::remote(path)?;
        self.with_session(move |ftp| match ftp.size(&remote) {
            Ok(_) => Ok(true),
            Err(FtpError::UnexpectedResponse(r)) if r.status == Status::FileUnavailable => Ok(false),
            Err(e) => Err(ftp_error(e, &remote)),
        })
        .await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let (source, target) = (from.clone(), to.clone());
        self.with_session(move |ftp| {
            let data = fetch(ftp, &source)?;
            store(ftp, &target, &data)
        })
        .await?;
        self.expirations.forget(self, to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let (from_remote, to_remote) = (Self::remote(from)?, Self::remote(to)?);
        let parent = to.parent().unwrap_or_default();
        self.with_session(move |ftp| {
            ftp.size(&from_remote).map_err(|e| ftp_error(e, &from_remote))?;
            mkdir_all(ftp, &parent)?;
            if ftp.rename(&from_remote, &to_remote).is_err() {
                let _ = ftp.rm(&to_remote);
                ftp.rename(&from_remote, &to_remote)
                    .map_err(|e| ftp_error(e, &from_remote))?;
            }
            Ok(())
        })
        .await?;
        self.expirations.rename(self, from, to).await
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        Ok(self.walk(dir, recursive).await?.0)
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        Ok(self.walk(dir, recursive).await?.1)
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        Ok(once_stream(self.get(path).await?))
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.write(path, data).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.write(path, data).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let remote = Self::remote(path)?;
        let (size, modified) = self
            .with_session(move |ftp| {
                let size = ftp.size(&remote).map_err(|e| ftp_error(e, &remote))?;
                // MDTM is an extension; not every server has it.
                let modified = ftp.mdtm(&remote).ok().map(|t| t.and_utc());
                Ok((size as u64, modified))
            })
            .await?;

        Ok(FileMetadata {
            path: path.clone(),
            size,
            mime_type: guess_mime(path),
            last_modified: modified,
            visibility: None,
        })
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        let path = path.clone();
        self.with_session(move |ftp| mkdir_all(ftp, &path)).await
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        let dir = path.clone();
        let remote = Self::remote(path)?;
        self.with_session(move |ftp| {
            let (files, mut dirs) = walk_tree(ftp, &dir, true)?;
            for file in files {
                let file = dir.join_path(&file).as_str();
                ftp.rm(&file).map_err(|e| ftp_error(e, &file))?;
            }
            // Deepest first.
            dirs.sort_by_key(|d| std::cmp::Reverse(d.components().len()));
            for sub in dirs {
                let sub = dir.join_path(&sub).as_str();
                ftp.rmdir(&sub).map_err(|e| ftp_error(e, &sub))?;
            }
            ftp.rmdir(&remote).map_err(|e| ftp_error(e, &remote))
        })
        .await?;
        self.expirations.forget_under(self, path).await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        self.write(path, content).await?;
        self.expirations.record(self, path, expires_at).await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.expirations.sweep(self, dir, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let lines = vec![
            "drwxr-xr-x 2 user group 4096 Jan 10 12:00 .".to_string(),
            "drwxr-xr-x 2 user group 4096 Jan 10 12:00 ..".to_string(),
            "-rw-r--r-- 1 user group 1024 Jan 10 12:00 report.pdf".to_string(),
            "drwxr-xr-x 2 user group 4096 Jan 10 12:00 images".to_string(),
            "total 12".to_string(),
        ];
        assert_eq!(
            parse_listing(&lines),
            vec![
                ("report.pdf".to_string(), false),
                ("images".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: FtpConfig =
            serde_json::from_value(serde_json::json!({ "host": "ftp.example.com" })).unwrap();
        assert_eq!(config.port, 21);
        assert_eq!(config.username, "anonymous");
        assert_eq!(config.timeout_secs, 30);
        assert!(config.root.is_none());
    }

    #[test]
    fn test_remote_paths_are_relative() {
        let path = StoragePath::parse("/a/b.txt").unwrap();
        assert_eq!(FtpDriver::remote(&path).unwrap(), "a/b.txt");
        assert!(FtpDriver::remote(&StoragePath::root()).is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(FtpDriver::new(FtpConfig::new("")).is_err());
        let driver = FtpDriver::new(FtpConfig::new("ftp.example.com")).unwrap();
        assert_eq!(driver.name(), "ftp");
        assert!(!driver.capabilities().visibility);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_failure() {
        let mut config = FtpConfig::new("127.0.0.1");
        config.port = 1;
        config.timeout_secs = 2;
        let driver = FtpDriver::new(config).unwrap();

        let err = driver
            .get(&StoragePath::parse("a.txt").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stowage_common::ErrorKind::TransportFailure);
    }
}
