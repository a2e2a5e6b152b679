//! SFTP storage driver.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use russh::client;
use russh::Disconnect;
use russh_keys::key;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    concat_existing, guess_mime, once_stream, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TimedOptions,
};
use crate::expiration::{resolve_expiry, ExpirationIndex};

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

/// SFTP driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM/OpenSSH private key text.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Server directory every path resolves under.
    #[serde(default)]
    pub root: Option<String>,
    /// Expected server key fingerprint (`SHA256:...` form, prefix optional).
    /// Any key is accepted when unset.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

struct ClientHandler {
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &key::PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(fingerprint_matches(
            self.expected_fingerprint.as_deref(),
            &key.fingerprint(),
        ))
    }
}

/// Compare a configured fingerprint with the server's, ignoring the
/// optional `SHA256:` prefix.
fn fingerprint_matches(expected: Option<&str>, actual: &str) -> bool {
    match expected {
        None => true,
        Some(expected) => {
            let strip = |f: &str| f.trim().trim_start_matches("SHA256:").to_string();
            strip(expected) == strip(actual)
        }
    }
}

/// One SSH connection with its SFTP subsystem.
struct Connection {
    handle: client::Handle<ClientHandler>,
    sftp: SftpSession,
}

impl Connection {
    async fn close(self, host: &str) {
        if let Err(e) = self.sftp.close().await {
            warn!(host = %host, error = %e, "SFTP close failed");
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(host = %host, error = %e, "SSH disconnect failed");
        }
    }
}

/// SFTP storage driver.
///
/// Every operation opens its own SSH connection and SFTP subsystem and
/// closes both before returning. Visibility maps to permission bits
/// (0644 public, 0600 private).
pub struct SftpDriver {
    config: Arc<SftpConfig>,
    expirations: ExpirationIndex,
}

impl SftpDriver {
    pub fn new(config: SftpConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(Error::InvalidInput("SFTP host is empty".to_string()));
        }
        if config.password.is_none() && config.private_key.is_none() {
            return Err(Error::InvalidInput(
                "SFTP needs a password or a private key".to_string(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            expirations: ExpirationIndex::for_backend("sftp"),
        })
    }

    async fn connect(&self) -> Result<Connection> {
        let config = &self.config;
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(config.timeout_secs)),
            ..client::Config::default()
        });
        let handler = ClientHandler {
            expected_fingerprint: config.host_key_fingerprint.clone(),
        };

        let connecting = client::connect(ssh_config, (config.host.as_str(), config.port), handler);
        let mut handle = tokio::time::timeout(Duration::from_secs(config.timeout_secs), connecting)
            .await
            .map_err(|_| Error::Transport(format!("SSH connect to {} timed out", config.host)))?
            .map_err(|e| match e {
                russh::Error::UnknownKey => {
                    Error::Authentication(format!("Host key of {} does not match", config.host))
                }
                other => Error::Transport(format!("SSH connection failed: {}", other)),
            })?;

        let authenticated = match (&config.private_key, &config.password) {
            (Some(pem), _) => {
                let key_pair = russh_keys::decode_secret_key(pem, config.passphrase.as_deref())
                    .map_err(|e| Error::InvalidInput(format!("Invalid private key: {}", e)))?;
                handle
                    .authenticate_publickey(&config.username, Arc::new(key_pair))
                    .await
            }
            (None, Some(password)) => handle.authenticate_password(&config.username, password).await,
            (None, None) => Ok(false),
        }
        .map_err(|e| Error::Transport(format!("SSH authentication error: {}", e)))?;

        if !authenticated {
            return Err(Error::Authentication(format!(
                "SFTP authentication failed for user: {}",
                config.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transport(format!("Failed to open SSH channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Transport(format!("Failed to request SFTP subsystem: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Transport(format!("SFTP session initialization failed: {}", e)))?;

        debug!(host = %config.host, "SFTP session opened");
        Ok(Connection { handle, sftp })
    }

    /// Run `op` on a fresh connection, closed whatever `op` returns.
    async fn run<T>(
        &self,
        op: impl for<'a> FnOnce(&'a SftpSession) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let connection = self.connect().await?;
        let result = op(&connection.sftp).await;
        connection.close(&self.config.host).await;
        result
    }

    /// Server-side path of `path`.
    fn remote(&self, path: &StoragePath) -> String {
        remote_path(self.config.root.as_deref(), path)
    }

    fn remote_file(&self, path: &StoragePath) -> Result<String> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(self.remote(path))
    }

    async fn walk(&self, dir: &StoragePath, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
        let base = self.remote(dir);
        let (mut files, mut dirs) = self
            .run(move |sftp| async move { walk_tree(sftp, &base, recursive).await }.boxed())
            .await?;
        if dir.is_root() {
            files.retain(|f| !self.expirations.is_index(f));
        }
        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }

    /// Ancestors of `path` on the server, shallowest first.
    /// Upload `content` over `path`, leaving any expiry record alone.
    async fn write(
        &self,
        path: &StoragePath,
        content: Bytes,
        visibility: Option<Visibility>,
    ) -> Result<()> {
        let remote = self.remote_file(path)?;
        let ancestors = self.remote_ancestors(path);
        debug!(path = %path, size = content.len(), "SFTP upload");

        self.run(move |sftp| {
            async move {
                mkdir_all(sftp, &ancestors).await?;
                write_atomic(sftp, &remote, &content, visibility).await
            }
            .boxed()
        })
        .await
    }

    fn remote_ancestors(&self, path: &StoragePath) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.is_root() {
                break;
            }
            ancestors.push(self.remote(&dir));
            current = dir.parent();
        }
        ancestors.reverse();
        ancestors
    }
}

/// Join the configured root and a logical path.
fn remote_path(root: Option<&str>, path: &StoragePath) -> String {
    let relative = path.as_str();
    match root.filter(|r| !r.is_empty()) {
        None if relative.is_empty() => ".".to_string(),
        None => relative,
        Some(root) => {
            let root = root.trim_end_matches('/');
            if relative.is_empty() && !root.is_empty() {
                root.to_string()
            } else {
                format!("{}/{}", root, relative)
            }
        }
    }
}

fn sftp_error(err: SftpError, path: &str) -> Error {
    match err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => Error::NotFound(format!("File not found: {}", path)),
            StatusCode::PermissionDenied => {
                Error::PermissionDenied(format!("Permission denied: {}", path))
            }
            _ => Error::Transport(format!("SFTP error on {}: {}", path, status.error_message)),
        },
        other => Error::Transport(format!("SFTP error on {}: {}", path, other)),
    }
}

async fn mkdir_all(sftp: &SftpSession, dirs: &[String]) -> Result<()> {
    for dir in dirs {
        let exists = sftp.try_exists(dir).await.map_err(|e| sftp_error(e, dir))?;
        if !exists {
            sftp.create_dir(dir).await.map_err(|e| sftp_error(e, dir))?;
        }
    }
    Ok(())
}

async fn read_all(sftp: &SftpSession, remote: &str) -> Result<Bytes> {
    let mut file = sftp.open(remote).await.map_err(|e| sftp_error(e, remote))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Permission bits for a rewritten file: the requested visibility,
/// otherwise the bits the file already had.
fn target_mode(requested: Option<Visibility>, existing: Option<u32>) -> Option<u32> {
    requested
        .map(Visibility::file_mode)
        .or_else(|| existing.map(|mode| mode & 0o7777))
}

async fn current_mode(sftp: &SftpSession, remote: &str) -> Option<u32> {
    sftp.metadata(remote).await.ok().and_then(|a| a.permissions)
}

/// Write to a temporary sibling, then rename over `remote`.
///
/// Without a requested visibility the existing file's permissions carry
/// over to the replacement.
async fn write_atomic(
    sftp: &SftpSession,
    remote: &str,
    content: &[u8],
    visibility: Option<Visibility>,
) -> Result<()> {
    let (dir, _) = remote.rsplit_once('/').unwrap_or((".", remote));
    let tmp = format!("{}/.stowage-{}.tmp", dir, Uuid::new_v4());
    let existing = match visibility {
        Some(_) => None,
        None => current_mode(sftp, remote).await,
    };
    let mode = target_mode(visibility, existing);

    let written: Result<()> = async {
        let mut file = sftp.create(&tmp).await.map_err(|e| sftp_error(e, &tmp))?;
        file.write_all(content).await?;
        file.flush().await?;
        file.shutdown().await?;
        if let Some(mode) = mode {
            let mut attributes = FileAttributes::empty();
            attributes.permissions = Some(mode);
            sftp.set_metadata(&tmp, attributes)
                .await
                .map_err(|e| sftp_error(e, &tmp))?;
        }
        if sftp.rename(&tmp, remote).await.is_err() {
            // SFTPv3 servers refuse to rename over an existing file.
            let _ = sftp.remove_file(remote).await;
            sftp.rename(&tmp, remote)
                .await
                .map_err(|e| sftp_error(e, remote))?;
        }
        Ok(())
    }
    .await;

    if written.is_err() {
        let _ = sftp.remove_file(&tmp).await;
    }
    written
}

async fn walk_tree(sftp: &SftpSession, base: &str, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![StoragePath::root()];

    while let Some(relative) = pending.pop() {
        let remote = if relative.is_root() {
            base.to_string()
        } else {
            format!("{}/{}", base, relative.as_str())
        };
        let entries = match sftp.read_dir(&remote).await {
            Ok(entries) => entries,
            Err(e) => match sftp_error(e, &remote) {
                Error::NotFound(_) => continue,
                other => return Err(other),
            },
        };
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." || name.starts_with(".stowage-") {
                continue;
            }
            let child = relative.join(&name)?;
            if entry.file_type().is_dir() {
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
impl StorageDriver for SftpDriver {
    fn name(&self) -> &str {
        "sftp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata: true,
            directories: true,
            visibility: true,
            timed: true,
            ..Capabilities::default()
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        self.write(path, content, options.visibility).await?;
        self.expirations.forget(self, path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let remote = self.remote_file(path)?;
        self.run(move |sftp| async move { read_all(sftp, &remote).await }.boxed())
            .await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let remote = self.remote_file(path)?;
        self.run(move |sftp| {
            async move {
                sftp.remove_file(&remote)
                    .await
                    .map_err(|e| sftp_error(e, &remote))
            }
            .boxed()
        })
        .await?;
        self.expirations.forget(self, path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        let remote = self.remote(path);
        self.run(move |sftp| {
            async move {
                sftp.try_exists(&remote)
                    .await
                    .map_err(|e| sftp_error(e, &remote))
            }
            .boxed()
        })
        .await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_remote = self.remote_file(from)?;
        let to_remote = self.remote_file(to)?;
        let ancestors = self.remote_ancestors(to);
        self.run(move |sftp| {
            async move {
                let visibility = current_mode(sftp, &from_remote)
                    .await
                    .map(Visibility::from_file_mode);
                let data = read_all(sftp, &from_remote).await?;
                mkdir_all(sftp, &ancestors).await?;
                write_atomic(sftp, &to_remote, &data, visibility).await
            }
            .boxed()
        })
        .await?;
        self.expirations.forget(self, to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_remote = self.remote_file(from)?;
        let to_remote = self.remote_file(to)?;
        let ancestors = self.remote_ancestors(to);
        self.run(move |sftp| {
            async move {
                sftp.metadata(&from_remote)
                    .await
                    .map_err(|e| sftp_error(e, &from_remote))?;
                mkdir_all(sftp, &ancestors).await?;
                if sftp.rename(&from_remote, &to_remote).await.is_err() {
                    let _ = sftp.remove_file(&to_remote).await;
                    sftp.rename(&from_remote, &to_remote)
                        .await
                        .map_err(|e| sftp_error(e, &from_remote))?;
                }
                Ok(())
            }
            .boxed()
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
        self.write(path, data, None).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.write(path, data, None).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let remote = self.remote_file(path)?;
        let attributes = self
            .run(move |sftp| {
                async move {
                    sftp.metadata(&remote)
                        .await
                        .map_err(|e| sftp_error(e, &remote))
                }
                .boxed()
            })
            .await?;

        Ok(FileMetadata {
            path: path.clone(),
            size: attributes.size.unwrap_or(0),
            mime_type: guess_mime(path),
            last_modified: attributes
                .mtime
                .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0)),
            visibility: attributes.permissions.map(Visibility::from_file_mode),
        })
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        let mut dirs = self.remote_ancestors(path);
        if !path.is_root() {
            dirs.push(self.remote(path));
        }
        self.run(move |sftp| async move { mkdir_all(sftp, &dirs).await }.boxed())
            .await
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        let base = self.remote(path);
        self.run(move |sftp| {
            async move {
                sftp.metadata(&base).await.map_err(|e| sftp_error(e, &base))?;
                let (files, mut dirs) = walk_tree(sftp, &base, true).await?;
                for file in files {
                    let remote = format!("{}/{}", base, file.as_str());
                    sftp.remove_file(&remote)
                        .await
                        .map_err(|e| sftp_error(e, &remote))?;
                }
                dirs.sort_by_key(|d| std::cmp::Reverse(d.components().len()));
                for dir in dirs {
                    let remote = format!("{}/{}", base, dir.as_str());
                    sftp.remove_dir(&remote)
                        .await
                        .map_err(|e| sftp_error(e, &remote))?;
                }
                sftp.remove_dir(&base).await.map_err(|e| sftp_error(e, &base))
            }
            .boxed()
        })
        .await?;
        self.expirations.forget_under(self, path).await
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        self.metadata(path)
            .await?
            .visibility
            .ok_or_else(|| Error::Transport("Server did not report permissions".to_string()))
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let remote = self.remote_file(path)?;
        self.run(move |sftp| {
            async move {
                let mut attributes = FileAttributes::empty();
                attributes.permissions = Some(visibility.file_mode());
                sftp.set_metadata(&remote, attributes)
                    .await
                    .map_err(|e| sftp_error(e, &remote))
            }
            .boxed()
        })
        .await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        self.write(path, content, options.visibility).await?;
        self.expirations.record(self, path, expires_at).await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.expirations.sweep(self, dir, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path(Some("/srv/data"), &p("a/b.txt")), "/srv/data/a/b.txt");
        assert_eq!(remote_path(Some("/srv/data/"), &p("")), "/srv/data");
        assert_eq!(remote_path(Some("/"), &p("a.txt")), "/a.txt");
        assert_eq!(remote_path(None, &p("a.txt")), "a.txt");
        assert_eq!(remote_path(None, &p("")), ".");
    }

    #[test]
    fn test_rewrite_keeps_existing_permissions() {
        assert_eq!(target_mode(None, Some(0o100600)), Some(0o600));
        assert_eq!(target_mode(None, Some(0o100644)), Some(0o644));
        assert_eq!(target_mode(Some(Visibility::Public), Some(0o100600)), Some(0o644));
        assert_eq!(target_mode(Some(Visibility::Private), None), Some(0o600));
        assert_eq!(target_mode(None, None), None);
    }

    #[test]
    fn test_fingerprint_matching() {
        assert!(fingerprint_matches(None, "anything"));
        assert!(fingerprint_matches(Some("SHA256:abc"), "abc"));
        assert!(fingerprint_matches(Some("abc"), "abc"));
        assert!(!fingerprint_matches(Some("abc"), "abd"));
    }

    #[test]
    fn test_config_requires_credentials() {
        let config: SftpConfig = serde_json::from_value(serde_json::json!({
            "host": "sftp.example.com",
            "username": "deploy"
        }))
        .unwrap();
        assert_eq!(config.port, 22);
        assert!(SftpDriver::new(config.clone()).is_err());

        let config = SftpConfig {
            password: Some("secret".to_string()),
            root: Some("/srv".to_string()),
            ..config
        };
        let driver = SftpDriver::new(config).unwrap();
        assert_eq!(
            driver.remote_ancestors(&p("a/b/c.txt")),
            vec!["/srv/a".to_string(), "/srv/a/b".to_string()]
        );
    }

    #[test]
    fn test_status_mapping() {
        let status = |code| {
            SftpError::Status(russh_sftp::protocol::Status {
                id: 1,
                status_code: code,
                error_message: "x".to_string(),
                language_tag: "en".to_string(),
            })
        };
        assert!(sftp_error(status(StatusCode::NoSuchFile), "a").is_not_found());
        assert!(matches!(
            sftp_error(status(StatusCode::PermissionDenied), "a"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            sftp_error(status(StatusCode::Failure), "a"),
            Error::Transport(_)
        ));
    }
}
