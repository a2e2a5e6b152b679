//! Google Drive v3 API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use stowage_common::{Error, Result};

use crate::driver::ByteStream;
use crate::oauth::TokenManager;

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Chunk size for resumable uploads (must be a multiple of 256KB).
const CHUNK_SIZE: usize = 256 * 1024 * 4;

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents,trashed";
const LIST_FIELDS: &str = "files(id,name,mimeType,size,modifiedTime,parents,trashed),nextPageToken";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// A sharing permission on a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
}

impl Permission {
    /// Anyone with the link can read.
    pub fn anyone_reader() -> Self {
        Self {
            id: String::new(),
            kind: "anyone".to_string(),
            role: "reader".to_string(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.kind == "anyone"
    }
}

#[derive(Debug, Deserialize)]
struct PermissionListResponse {
    #[serde(default)]
    permissions: Vec<Permission>,
}

/// Escape a value for a single-quoted Drive query literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Query matching live children named `name` under `parent_id`.
pub fn child_query(name: &str, parent_id: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and trashed = false",
        escape_query(name),
        escape_query(parent_id)
    )
}

/// Multipart/related body carrying JSON metadata and the media.
fn multipart_body(boundary: &str, metadata: &serde_json::Value, mime_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 256);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--", boundary).as_bytes());
    body
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    pub fn new(token_manager: Arc<TokenManager>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to get file: {}", e)))?;

        handle_response(response).await
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to create folder: {}", e)))?;

        handle_response(response).await
    }

    /// Run a `files.list` query, following every page.
    async fn query(&self, query: &str, page_size: &str, all_pages: bool) -> Result<Vec<DriveFile>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, self.auth_header().await?)
                .query(&[
                    ("q", query),
                    ("fields", LIST_FIELDS),
                    ("pageSize", page_size),
                ]);

            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Transport(format!("Failed to list files: {}", e)))?;

            let list_response: FileListResponse = handle_response(response).await?;
            all_files.extend(list_response.files);

            match list_response.next_page_token {
                Some(token) if all_pages => page_token = Some(token),
                _ => break,
            }
        }

        Ok(all_files)
    }

    /// Every live child of a folder.
    pub async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        self.query(&query, "1000", true).await
    }

    /// Children of `parent_id` named `name`.
    ///
    /// Drive allows duplicate names; at most two are fetched, which is
    /// enough for callers to detect ambiguity.
    pub async fn find_children(&self, name: &str, parent_id: &str) -> Result<Vec<DriveFile>> {
        self.query(&child_query(name, parent_id), "2", false).await
    }

    /// Create a file with a single multipart request.
    pub async fn upload_simple(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
            "mimeType": mime_type,
        });

        let boundary = format!("stowage-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &metadata, mime_type, &data);

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to upload file: {}", e)))?;

        handle_response(response).await
    }

    /// Replace the content of an existing file.
    pub async fn update_file(&self, file_id: &str, mime_type: &str, data: Bytes) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_UPLOAD_BASE, file_id);

        let response = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header(header::CONTENT_TYPE, mime_type)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to update file: {}", e)))?;

        handle_response(response).await
    }

    /// Start a resumable upload session and return its URI.
    async fn start_resumable_upload(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        total_size: u64,
    ) -> Result<String> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
            "mimeType": mime_type,
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to start resumable upload: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        // Extract upload URI from Location header
        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Transport("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Transport(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Upload one chunk. Returns the file once the last chunk lands.
    async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: Bytes,
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to upload chunk: {}", e)))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let file: DriveFile = response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Failed to parse upload response: {}", e)))?;
            Ok(Some(file))
        } else if status == StatusCode::PERMANENT_REDIRECT {
            // 308 Resume Incomplete
            Ok(None)
        } else {
            Err(status_error(response).await)
        }
    }

    /// Create a file through a resumable session, in `CHUNK_SIZE` pieces.
    pub async fn upload_resumable(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<DriveFile> {
        let total_size = data.len() as u64;
        let upload_uri = self
            .start_resumable_upload(name, parent_id, mime_type, total_size)
            .await?;

        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + CHUNK_SIZE).min(data.len());
            let chunk = data.slice(offset..end);
            if let Some(file) = self
                .upload_chunk(&upload_uri, chunk, offset as u64, total_size)
                .await?
            {
                return Ok(file);
            }
            offset = end;
        }

        Err(Error::Transport("Upload did not complete".to_string()))
    }

    pub async fn download(&self, file_id: &str) -> Result<Bytes> {
        let response = self.media_request(file_id).await?;
        response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read download response: {}", e)))
    }

    pub async fn download_stream(&self, file_id: &str) -> Result<ByteStream> {
        let response = self.media_request(file_id).await?;
        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Transport(format!("Stream read error: {}", e))));
        Ok(Box::pin(stream))
    }

    async fn media_request(&self, file_id: &str) -> Result<reqwest::Response> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to download file: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }

    /// Delete a file or folder (folders take their contents along).
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to delete file: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    /// Rename and/or reparent a file.
    pub async fn move_file(
        &self,
        file_id: &str,
        new_name: &str,
        new_parent: &str,
        current_parents: &[String],
    ) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let metadata = serde_json::json!({ "name": new_name });
        let remove_parents = current_parents.join(",");

        let mut request = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS), ("addParents", new_parent)]);
        if !remove_parents.is_empty() {
            request = request.query(&[("removeParents", remove_parents.as_str())]);
        }

        let response = request
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to move file: {}", e)))?;

        handle_response(response).await
    }

    pub async fn copy_file(&self, file_id: &str, new_name: &str, parent_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files/{}/copy", DRIVE_API_BASE, file_id);
        let metadata = serde_json::json!({
            "name": new_name,
            "parents": [parent_id]
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to copy file: {}", e)))?;

        handle_response(response).await
    }

    pub async fn list_permissions(&self, file_id: &str) -> Result<Vec<Permission>> {
        let url = format!("{}/files/{}/permissions", DRIVE_API_BASE, file_id);
        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", "permissions(id,type,role)")])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to list permissions: {}", e)))?;

        let list: PermissionListResponse = handle_response(response).await?;
        Ok(list.permissions)
    }

    pub async fn create_permission(&self, file_id: &str, permission: &Permission) -> Result<()> {
        let url = format!("{}/files/{}/permissions", DRIVE_API_BASE, file_id);
        let body = serde_json::json!({ "type": permission.kind, "role": permission.role });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to create permission: {}", e)))?;

        let _: Permission = handle_response(response).await?;
        Ok(())
    }

    pub async fn delete_permission(&self, file_id: &str, permission_id: &str) -> Result<()> {
        let url = format!(
            "{}/files/{}/permissions/{}",
            DRIVE_API_BASE, file_id, permission_id
        );
        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to delete permission: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}

/// Map a non-success status onto the error taxonomy.
pub(crate) fn error_for_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("Resource not found: {}", body)),
        StatusCode::UNAUTHORIZED => Error::Authentication("Invalid or expired token".to_string()),
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("Access denied: {}", body)),
        _ => Error::Transport(format!("API error: {} - {}", status, body)),
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error_for_status(status, &body)
}

/// Handle API response with error checking.
async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if response.status().is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))
    } else {
        Err(status_error(response).await)
    }
}
