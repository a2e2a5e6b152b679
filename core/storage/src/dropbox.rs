//! Dropbox storage driver (HTTP API v2).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stowage_common::{Error, Result, StoragePath};

use crate::driver::{
    concat_existing, exists_from, guess_mime, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TimedOptions,
};
use crate::expiration::{resolve_expiry, ExpirationIndex};
use crate::oauth::{ClientCredentials, TokenManager, Tokens, DROPBOX};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Single-request uploads are capped at 150 MiB; larger ones use a session.
const SINGLE_UPLOAD_LIMIT: usize = 150 * 1024 * 1024;
const SESSION_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Dropbox driver configuration.
///
/// Either a long-lived `access_token` or a `tokens` set (with `client`
/// credentials for refreshing) must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropboxConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub tokens: Option<Tokens>,
    #[serde(default)]
    pub client: Option<ClientCredentials>,
    /// Folder every path resolves under, e.g. `/app`.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Entry {
    File {
        name: String,
        #[serde(default)]
        path_display: Option<String>,
        size: u64,
        #[serde(default)]
        server_modified: Option<DateTime<Utc>>,
    },
    Folder {
        name: String,
        #[serde(default)]
        path_display: Option<String>,
    },
    Deleted {
        name: String,
    },
}

impl Entry {
    fn path_display(&self) -> Option<&str> {
        match self {
            Entry::File { path_display, .. } | Entry::Folder { path_display, .. } => {
                path_display.as_deref()
            }
            Entry::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<Entry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct UploadSessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

/// Dropbox storage driver.
///
/// Objects are addressed by their full path under the configured root.
/// Dropbox creates parent folders implicitly on upload, copy and move.
pub struct DropboxDriver {
    http: Client,
    token_manager: Arc<TokenManager>,
    root: String,
    expirations: ExpirationIndex,
}

impl DropboxDriver {
    pub fn new(config: DropboxConfig) -> Result<Self> {
        let tokens = match (config.tokens, config.access_token) {
            (Some(tokens), _) => tokens,
            (None, Some(token)) => Tokens::fixed(token),
            (None, None) => {
                return Err(Error::InvalidInput(
                    "Dropbox needs an access_token or tokens".to_string(),
                ))
            }
        };
        let token_manager = Arc::new(TokenManager::from_config(
            DROPBOX,
            config.client.as_ref(),
            tokens,
        )?);

        let mut builder = Client::builder().user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")));
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
            root: normalize_root(config.root.as_deref()),
            expirations: ExpirationIndex::for_backend("dropbox"),
        })
    }

    /// Current tokens (useful for persisting a refreshed token).
    pub async fn tokens(&self) -> Tokens {
        self.token_manager.tokens().await
    }

    fn remote(&self, path: &StoragePath) -> String {
        dropbox_path(&self.root, path)
    }

    fn remote_file(&self, path: &StoragePath) -> Result<String> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(self.remote(path))
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// POST a JSON RPC call to the API host.
    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        args: serde_json::Value,
        subject: &str,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{}", API_BASE, endpoint))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .json(&args)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Dropbox {} failed: {}", endpoint, e)))?;
        let response = check(response, subject).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))
    }

    /// POST to the content host with arguments in the `Dropbox-API-Arg` header.
    async fn content(
        &self,
        endpoint: &str,
        args: serde_json::Value,
        body: Bytes,
        subject: &str,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/{}", CONTENT_BASE, endpoint))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header(API_ARG_HEADER, api_arg(&args))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Dropbox {} failed: {}", endpoint, e)))?;
        check(response, subject).await
    }

    async fn get_metadata(&self, path: &StoragePath) -> Result<Entry> {
        let remote = self.remote_file(path)?;
        self.rpc("files/get_metadata", json!({ "path": remote }), &remote)
            .await
    }

    async fn upload(&self, remote: &str, content: Bytes) -> Result<()> {
        let commit = json!({
            "path": remote,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });

        if content.len() <= SINGLE_UPLOAD_LIMIT {
            self.content("files/upload", commit, content, remote).await?;
            return Ok(());
        }

        debug!(path = %remote, size = content.len(), "Dropbox upload session");
        let first = content.slice(..SESSION_CHUNK_SIZE);
        let session: UploadSessionStart = self
            .content("files/upload_session/start", json!({ "close": false }), first, remote)
            .await?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))?;

        let mut offset = SESSION_CHUNK_SIZE;
        while content.len() - offset > SESSION_CHUNK_SIZE {
            let chunk = content.slice(offset..offset + SESSION_CHUNK_SIZE);
            let args = json!({
                "cursor": { "session_id": session.session_id, "offset": offset },
                "close": false,
            });
            self.content("files/upload_session/append_v2", args, chunk, remote)
                .await?;
            offset += SESSION_CHUNK_SIZE;
        }

        let args = json!({
            "cursor": { "session_id": session.session_id, "offset": offset },
            "commit": commit,
        });
        self.content("files/upload_session/finish", args, content.slice(offset..), remote)
            .await?;
        Ok(())
    }

    /// Every entry under `dir`, following `has_more` cursors.
    async fn list_entries(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<Entry>> {
        let remote = self.remote(dir);
        let first: ListFolderResponse = match self
            .rpc(
                "files/list_folder",
                json!({ "path": remote, "recursive": recursive }),
                &remote,
            )
            .await
        {
            Ok(page) => page,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = first.entries;
        let mut cursor = first.cursor;
        let mut has_more = first.has_more;
        while has_more {
            let page: ListFolderResponse = self
                .rpc("files/list_folder/continue", json!({ "cursor": cursor }), &remote)
                .await?;
            entries.extend(page.entries);
            cursor = page.cursor;
            has_more = page.has_more;
        }
        Ok(entries)
    }

    /// Split a listing into (files, folders) relative to `dir`.
    async fn walk(&self, dir: &StoragePath, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
        let base = self.remote(dir);
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        for entry in self.list_entries(dir, recursive).await? {
            let relative = match entry.path_display().and_then(|p| relative_to(&base, p)) {
                Some(relative) => relative,
                None => continue,
            };
            if relative.is_root() {
                continue;
            }
            match entry {
                Entry::File { .. } => files.push(relative),
                Entry::Folder { .. } => dirs.push(relative),
                Entry::Deleted { .. } => {}
            }
        }

        if dir.is_root() {
            files.retain(|f| !self.expirations.is_index(f));
        }
        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }

    /// Remove `remote` if present so a copy or move can overwrite it.
    async fn clear(&self, remote: &str) -> Result<()> {
        match self
            .rpc::<serde_json::Value>("files/delete_v2", json!({ "path": remote }), remote)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `/root` form of the configured root, empty for the account root.
fn normalize_root(root: Option<&str>) -> String {
    let trimmed = root.unwrap_or("").trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Dropbox path of `path` under `root`. The account root is `""`.
fn dropbox_path(root: &str, path: &StoragePath) -> String {
    if path.is_root() {
        root.to_string()
    } else {
        format!("{}/{}", root, path.as_str())
    }
}

/// Logical path of `display` relative to `base`, compared case-insensitively
/// as Dropbox does.
fn relative_to(base: &str, display: &str) -> Option<StoragePath> {
    let head = display.get(..base.len())?;
    if !head.eq_ignore_ascii_case(base) {
        return None;
    }
    let rest = display.get(base.len()..)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    StoragePath::parse(rest).ok()
}

/// Serialize header arguments, escaping non-ASCII as `\uXXXX`.
fn api_arg(args: &serde_json::Value) -> String {
    let raw = args.to_string();
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    escaped
}

fn error_for_status(status: StatusCode, body: &str, subject: &str) -> Error {
    match status {
        StatusCode::CONFLICT => {
            let summary = serde_json::from_str::<ApiError>(body)
                .map(|e| e.error_summary)
                .unwrap_or_else(|_| body.to_string());
            if summary.contains("not_found") {
                Error::NotFound(format!("File not found: {}", subject))
            } else if summary.contains("not_file") || summary.contains("not_folder") {
                Error::InvalidInput(format!("Wrong entry type at {}: {}", subject, summary))
            } else if summary.contains("conflict") {
                Error::Conflict(format!("Conflict at {}: {}", subject, summary))
            } else {
                Error::Transport(format!("Dropbox error at {}: {}", subject, summary))
            }
        }
        StatusCode::UNAUTHORIZED => Error::Authentication("Invalid or expired token".to_string()),
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("Access denied: {}", body)),
        _ => Error::Transport(format!("API error: {} - {}", status, body)),
    }
}

async fn check(response: reqwest::Response, subject: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &body, subject))
}

#[async_trait]
impl StorageDriver for DropboxDriver {
    fn name(&self) -> &str {
        "dropbox"
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
        let remote = self.remote_file(path)?;
        debug!(path = %path, size = content.len(), "Dropbox upload");
        self.upload(&remote, content).await?;
        self.expirations.forget(self, path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let remote = self.remote_file(path)?;
        self.content("files/download", json!({ "path": remote }), Bytes::new(), &remote)
            .await?
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read download: {}", e)))
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let remote = self.remote_file(path)?;
        self.rpc::<serde_json::Value>("files/delete_v2", json!({ "path": remote }), &remote)
            .await?;
        self.expirations.forget(self, path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        exists_from(self.get_metadata(path).await)
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_remote = self.remote_file(from)?;
        let to_remote = self.remote_file(to)?;
        self.get_metadata(from).await?;
        self.clear(&to_remote).await?;
        self.rpc::<serde_json::Value>(
            "files/copy_v2",
            json!({ "from_path": from_remote, "to_path": to_remote, "autorename": false }),
            &from_remote,
        )
        .await?;
        self.expirations.forget(self, to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_remote = self.remote_file(from)?;
        let to_remote = self.remote_file(to)?;
        self.get_metadata(from).await?;
        self.clear(&to_remote).await?;
        self.rpc::<serde_json::Value>(
            "files/move_v2",
            json!({ "from_path": from_remote, "to_path": to_remote, "autorename": false }),
            &from_remote,
        )
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
        let remote = self.remote_file(path)?;
        let response = self
            .content("files/download", json!({ "path": remote }), Bytes::new(), &remote)
            .await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("Download interrupted: {}", e))));
        Ok(Box::pin(stream))
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.upload(&self.remote_file(path)?, data).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.upload(&self.remote_file(path)?, data).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        match self.get_metadata(path).await? {
            Entry::File {
                size,
                server_modified,
                ..
            } => Ok(FileMetadata {
                path: path.clone(),
                size,
                mime_type: guess_mime(path),
                last_modified: server_modified,
                visibility: None,
            }),
            Entry::Folder { name, .. } => {
                Err(Error::InvalidInput(format!("Is a directory: {}", name)))
            }
            Entry::Deleted { name } => Err(Error::NotFound(format!("File not found: {}", name))),
        }
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Ok(());
        }
        let remote = self.remote(path);
        match self
            .rpc::<serde_json::Value>(
                "files/create_folder_v2",
                json!({ "path": remote, "autorename": false }),
                &remote,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        match self.get_metadata(path).await? {
            Entry::Folder { .. } => {}
            _ => return Err(Error::InvalidInput(format!("Not a directory: {}", path))),
        }
        let remote = self.remote(path);
        self.rpc::<serde_json::Value>("files/delete_v2", json!({ "path": remote }), &remote)
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
        self.upload(&self.remote_file(path)?, content).await?;
        self.expirations.record(self, path, expires_at).await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.expirations.sweep(self, dir, Utc::now()).await
    }
}
