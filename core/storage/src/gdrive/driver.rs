//! Google Drive storage driver.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    concat_existing, exists_from, guess_mime, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TimedOptions,
};
use crate::expiration::{resolve_expiry, ExpirationIndex};
use crate::oauth::{ClientCredentials, TokenManager, Tokens, GOOGLE};

use super::client::{DriveClient, DriveFile, Permission};

/// Uploads above this size use a resumable session.
const RESUMABLE_THRESHOLD: usize = 5 * 1024 * 1024;

/// Google Drive driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// Folder every path resolves under.
    pub folder_id: String,
    /// OAuth2 tokens.
    pub tokens: Tokens,
    /// Client credentials, needed to refresh `tokens`.
    #[serde(default)]
    pub client: Option<ClientCredentials>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Google Drive storage driver.
///
/// Drive addresses files by id and allows duplicate names in a folder.
/// Every path-based call walks the path one component at a time from the
/// configured folder; a component matching more than one entry is an
/// `Error::Conflict`. Nothing is cached between calls, so the walk costs
/// one request per component.
pub struct GDriveDriver {
    folder_id: String,
    client: DriveClient,
    token_manager: Arc<TokenManager>,
    expirations: ExpirationIndex,
}

impl GDriveDriver {
    /// Create a new Google Drive driver.
    ///
    /// # Errors
    /// - Invalid OAuth configuration
    pub fn new(config: GDriveConfig) -> Result<Self> {
        let token_manager = Arc::new(TokenManager::from_config(
            GOOGLE,
            config.client.as_ref(),
            config.tokens,
        )?);
        let client = DriveClient::new(
            token_manager.clone(),
            config.timeout_secs.map(Duration::from_secs),
        )?;

        Ok(Self {
            folder_id: config.folder_id,
            client,
            token_manager,
            expirations: ExpirationIndex::for_backend("gdrive"),
        })
    }

    /// Current tokens (useful for persisting a refreshed token).
    pub async fn tokens(&self) -> Tokens {
        self.token_manager.tokens().await
    }

    /// The single child of `parent_id` named `name`, if any.
    async fn find_child(&self, parent_id: &str, name: &str, path: &StoragePath) -> Result<Option<DriveFile>> {
        let mut matches = self.client.find_children(name, parent_id).await?;
        if matches.len() > 1 {
            return Err(Error::Conflict(format!(
                "Ambiguous path, several entries named {:?}: {}",
                name, path
            )));
        }
        Ok(matches.pop())
    }

    /// Walk `path` from the root folder.
    async fn lookup(&self, path: &StoragePath) -> Result<DriveFile> {
        if path.is_root() {
            return self.client.get_file(&self.folder_id).await;
        }

        let mut current: Option<DriveFile> = None;
        for component in path.components() {
            let parent_id = current.as_ref().map_or(self.folder_id.as_str(), |f| f.id.as_str());
            match self.find_child(parent_id, component, path).await? {
                Some(file) => current = Some(file),
                None => return Err(Error::NotFound(format!("Path not found: {}", path))),
            }
        }
        current.ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    /// Walk to a regular file.
    async fn lookup_file(&self, path: &StoragePath) -> Result<DriveFile> {
        let file = self.lookup(path).await?;
        if file.is_folder() {
            return Err(Error::InvalidInput(format!("Is a directory: {}", path)));
        }
        Ok(file)
    }

    /// Folder id of `path`, creating missing folders on the way.
    async fn ensure_folder(&self, path: &StoragePath) -> Result<String> {
        let mut current_id = self.folder_id.clone();
        for component in path.components() {
            current_id = match self.find_child(&current_id, component, path).await? {
                Some(file) if file.is_folder() => file.id,
                Some(_) => {
                    return Err(Error::AlreadyExists(format!(
                        "A file is in the way of directory {}",
                        path
                    )))
                }
                None => {
                    debug!(folder = %component, "Creating Drive folder");
                    self.client.create_folder(component, &current_id).await?.id
                }
            };
        }
        Ok(current_id)
    }

    /// Parent folder id (created if missing) and file name of `path`.
    async fn destination(&self, path: &StoragePath) -> Result<(String, String)> {
        let name = path
            .name()
            .ok_or_else(|| Error::InvalidInput("Cannot address the root as a file".to_string()))?
            .to_string();
        let parent_id = self.ensure_folder(&path.parent().unwrap_or_default()).await?;
        Ok((parent_id, name))
    }

    /// Remove whatever file currently sits at the destination, so copy and
    /// move overwrite instead of creating a same-named sibling.
    async fn clear_destination(&self, parent_id: &str, name: &str, path: &StoragePath) -> Result<()> {
        if let Some(existing) = self.find_child(parent_id, name, path).await? {
            if existing.is_folder() {
                return Err(Error::InvalidInput(format!("Is a directory: {}", path)));
            }
            self.client.delete(&existing.id).await?;
        }
        Ok(())
    }

    fn to_metadata(&self, file: &DriveFile, path: &StoragePath) -> FileMetadata {
        FileMetadata {
            path: path.clone(),
            size: file.size_bytes().unwrap_or(0),
            mime_type: Some(file.mime_type.clone()),
            last_modified: file.modified_time,
            visibility: None,
        }
    }

    async fn current_visibility(&self, file_id: &str) -> Result<Visibility> {
        let permissions = self.client.list_permissions(file_id).await?;
        Ok(visibility_of(&permissions))
    }

    async fn apply_visibility(&self, file_id: &str, visibility: Visibility) -> Result<()> {
        let permissions = self.client.list_permissions(file_id).await?;
        let public: Vec<&Permission> = permissions.iter().filter(|p| p.is_public()).collect();

        match visibility {
            Visibility::Public if public.is_empty() => {
                self.client
                    .create_permission(file_id, &Permission::anyone_reader())
                    .await
            }
            Visibility::Public => Ok(()),
            Visibility::Private => {
                for permission in public {
                    self.client.delete_permission(file_id, &permission.id).await?;
                }
                Ok(())
            }
        }
    }

    /// Upload `content` to `path`, leaving any expiry record alone.
    ///
    /// An existing file is updated in place, so its sharing permissions
    /// survive unless `options` asks for a visibility.
    async fn write(&self, path: &StoragePath, content: Bytes, options: &PutOptions) -> Result<()> {
        let (parent_id, name) = self.destination(path).await?;
        let mime_type = options
            .content_type
            .clone()
            .or_else(|| guess_mime(path))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let file = match self.find_child(&parent_id, &name, path).await? {
            Some(existing) if existing.is_folder() => {
                return Err(Error::InvalidInput(format!("Is a directory: {}", path)))
            }
            Some(existing) => self.client.update_file(&existing.id, &mime_type, content).await?,
            None if content.len() > RESUMABLE_THRESHOLD => {
                self.client
                    .upload_resumable(&name, &parent_id, &mime_type, content)
                    .await?
            }
            None => {
                self.client
                    .upload_simple(&name, &parent_id, &mime_type, content)
                    .await?
            }
        };

        if let Some(visibility) = options.visibility {
            self.apply_visibility(&file.id, visibility).await?;
        }
        debug!(path = %path, file_id = %file.id, "Drive file written");
        Ok(())
    }

    /// Walk a folder tree collecting (files, folders) relative to `dir`.
    async fn walk(&self, dir: &StoragePath, recursive: bool) -> Result<(Vec<StoragePath>, Vec<StoragePath>)> {
        let root = match self.lookup(dir).await {
            Ok(file) if file.is_folder() => file,
            Ok(_) => return Err(Error::InvalidInput(format!("Not a directory: {}", dir))),
            Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut pending = vec![(root.id, StoragePath::root())];

        while let Some((folder_id, relative)) = pending.pop() {
            for child in self.client.list_folder(&folder_id).await? {
                let child_path = relative.join(&child.name)?;
                if child.is_folder() {
                    if recursive {
                        pending.push((child.id.clone(), child_path.clone()));
                    }
                    dirs.push(child_path);
                } else if !(dir.is_root() && self.expirations.is_index(&child_path)) {
                    files.push(child_path);
                }
            }
        }

        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }
}

/// Public when any permission grants access to anyone.
fn visibility_of(permissions: &[Permission]) -> Visibility {
    if permissions.iter().any(Permission::is_public) {
        Visibility::Public
    } else {
        Visibility::Private
    }
}

#[async_trait]
impl StorageDriver for GDriveDriver {
    fn name(&self) -> &str {
        "gdrive"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            public_url: true,
            metadata: true,
            directories: true,
            visibility: true,
            timed: true,
            ..Capabilities::default()
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        self.write(path, content, &options).await?;
        self.expirations.forget(self, path).await
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let file = self.lookup_file(path).await?;
        self.client.download(&file.id).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let file = self.lookup_file(path).await?;
        self.client.delete(&file.id).await?;
        self.expirations.forget(self, path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        exists_from(self.lookup(path).await)
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let source = self.lookup_file(from).await?;
        let (parent_id, name) = self.destination(to).await?;
        self.clear_destination(&parent_id, &name, to).await?;
        let copy = self.client.copy_file(&source.id, &name, &parent_id).await?;
        // Drive copies content, not sharing.
        if self.current_visibility(&source.id).await? == Visibility::Public {
            self.apply_visibility(&copy.id, Visibility::Public).await?;
        }
        self.expirations.forget(self, to).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let source = self.lookup_file(from).await?;
        let (parent_id, name) = self.destination(to).await?;
        self.clear_destination(&parent_id, &name, to).await?;
        self.client
            .move_file(&source.id, &name, &parent_id, &source.parents)
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
        let file = self.lookup_file(path).await?;
        self.client.download_stream(&file.id).await
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.write(path, data, &PutOptions::default()).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.write(path, data, &PutOptions::default()).await
    }

    /// Download link of a public file.
    ///
    /// # Errors
    /// - `InvalidInput` if the file is not shared with anyone
    async fn url(&self, path: &StoragePath) -> Result<String> {
        let file = self.lookup_file(path).await?;
        if self.current_visibility(&file.id).await? != Visibility::Public {
            return Err(Error::InvalidInput(format!(
                "File is private, make it public before asking for its URL: {}",
                path
            )));
        }
        Ok(format!(
            "https://drive.google.com/uc?id={}&export=download",
            file.id
        ))
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let file = self.lookup_file(path).await?;
        let mut metadata = self.to_metadata(&file, path);
        metadata.visibility = Some(self.current_visibility(&file.id).await?);
        Ok(metadata)
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        self.ensure_folder(path).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        let folder = self.lookup(path).await?;
        if !folder.is_folder() {
            return Err(Error::InvalidInput(format!("Not a directory: {}", path)));
        }
        self.client.delete(&folder.id).await?;
        self.expirations.forget_under(self, path).await
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        let file = self.lookup_file(path).await?;
        self.current_visibility(&file.id).await
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let file = self.lookup_file(path).await?;
        self.apply_visibility(&file.id, visibility).await
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        self.write(path, content, &options.put_options()).await?;
        self.expirations.record(self, path, expires_at).await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        self.expirations.sweep(self, dir, Utc::now()).await
    }
}
