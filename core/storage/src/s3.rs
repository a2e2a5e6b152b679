//! S3-compatible object storage driver.

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl, ObjectIdentifier,
    Permission as S3Permission, TaggingDirective,
};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use stowage_common::{Error, Result, StoragePath, Visibility};

use crate::driver::{
    concat_existing, exists_from, join_url, ByteStream, Capabilities, FileMetadata, PutOptions,
    StorageDriver, TemporaryUrlOptions, TimedOptions,
};
use crate::expiration::{is_expired, resolve_expiry};

/// Object tag carrying the expiry of timed objects, epoch milliseconds.
pub const EXPIRES_AT_TAG: &str = "expires-at";

/// Multipart part size for streamed uploads.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// Keys per `DeleteObjects` request (S3's limit).
const DELETE_BATCH: usize = 1000;

const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";

/// Characters escaped in a `CopySource` key. Slashes stay literal.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// S3 driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Static credentials. Without them the default AWS provider chain
    /// (environment, profile, instance metadata) is used.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Key prefix every path lives under.
    #[serde(default)]
    pub root: Option<String>,
    /// Base URL for `url()`.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// S3 storage driver.
///
/// Directories are emulated: listings split on `/`, and `make_directory`
/// writes a zero-byte `dir/` marker.
pub struct S3Driver {
    client: Client,
    bucket: String,
    prefix: StoragePath,
    public_url: Option<String>,
}

impl S3Driver {
    /// Build the SDK client described by `config`.
    pub async fn connect(config: S3Config) -> Result<Self> {
        let mut builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(
                    access_key,
                    secret_key,
                    config.session_token.clone(),
                    None,
                    "stowage-config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(Region::new("us-east-1"))
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_secs(secs))
                    .build(),
            );
        }
        builder = builder.force_path_style(config.force_path_style);

        let client = Client::from_conf(builder.build());
        Self::new(client, config)
    }

    /// Wrap an existing client.
    pub fn new(client: Client, config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::InvalidInput("S3 bucket name is empty".to_string()));
        }
        let prefix = match &config.root {
            Some(root) => StoragePath::parse(root)?,
            None => StoragePath::root(),
        };

        debug!(bucket = %config.bucket, prefix = %prefix, "Initializing S3 driver");
        Ok(Self {
            client,
            bucket: config.bucket,
            prefix,
            public_url: config.public_url,
        })
    }

    /// Object key of a file path.
    fn key(&self, path: &StoragePath) -> Result<String> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot address the root as a file".to_string()));
        }
        Ok(self.prefix.join_path(path).as_str())
    }

    /// Listing prefix of a directory path: empty or ending with `/`.
    fn dir_prefix(&self, dir: &StoragePath) -> String {
        let full = self.prefix.join_path(dir);
        if full.is_root() {
            String::new()
        } else {
            format!("{}/", full.as_str())
        }
    }

    /// All keys (and common prefixes, with a delimiter) under `prefix`.
    async fn list_keys(&self, prefix: &str, delimited: bool) -> Result<(Vec<String>, Vec<String>)> {
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take());
            if delimited {
                request = request.delimiter("/");
            }

            let output = request.send().await.map_err(|e| s3_error(e, prefix))?;
            keys.extend(output.contents().iter().filter_map(|o| o.key()).map(String::from));
            prefixes.extend(
                output
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(String::from),
            );

            match (output.is_truncated(), output.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok((keys, prefixes))
    }

    async fn head(&self, path: &StoragePath) -> Result<aws_sdk_s3::operation::head_object::HeadObjectOutput> {
        let key = self.key(path)?;
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error(e, &key))
    }

    async fn put_object(&self, key: &str, content: Bytes, options: &PutOptions, tagging: Option<String>) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(content.len() as i64)
            .body(S3ByteStream::from(content))
            .set_tagging(tagging);
        if let Some(content_type) = content_type(key, options) {
            request = request.content_type(content_type);
        }
        if let Some(visibility) = options.visibility {
            request = request.acl(canned_acl(visibility));
        }

        request.send().await.map_err(|e| {
            error!(key = %key, error = %DisplayErrorContext(&e), "S3 put_object failed");
            s3_error(e, key)
        })?;
        Ok(())
    }

    /// Upload the remaining parts of a multipart upload.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut stream: ByteStream,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut finished = false;

        while !finished {
            while buffer.len() < PART_SIZE {
                match stream.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                break;
            }

            let take = buffer.len().min(PART_SIZE);
            let part = buffer.split_to(take).freeze();
            let part_number = parts.len() as i32 + 1;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(S3ByteStream::from(part))
                .send()
                .await
                .map_err(|e| s3_error(e, key))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(String::from))
                    .part_number(part_number)
                    .build(),
            );
        }

        Ok(parts)
    }

    async fn expiry_of(&self, key: &str) -> Result<Option<i64>> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error(e, key))?;
        Ok(output
            .tag_set()
            .iter()
            .find(|tag| tag.key() == EXPIRES_AT_TAG)
            .and_then(|tag| tag.value().parse().ok()))
    }

    async fn acl_visibility(&self, key: &str) -> Result<Visibility> {
        let output = self
            .client
            .get_object_acl()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error(e, key))?;

        let public = output.grants().iter().any(|grant| {
            grant.grantee().and_then(|g| g.uri()) == Some(ALL_USERS_URI)
                && matches!(
                    grant.permission(),
                    Some(S3Permission::Read) | Some(S3Permission::FullControl)
                )
        });
        Ok(if public { Visibility::Public } else { Visibility::Private })
    }

    /// Visibility of the object at `key`, `None` when there is none.
    async fn existing_visibility(&self, key: &str) -> Result<Option<Visibility>> {
        match self.acl_visibility(key).await {
            Ok(visibility) => Ok(Some(visibility)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fill in the visibility of the object being replaced when `options`
    /// names none; a fresh PUT would otherwise reset the ACL.
    async fn keep_visibility(&self, key: &str, mut options: PutOptions) -> Result<PutOptions> {
        if options.visibility.is_none() {
            options.visibility = self.existing_visibility(key).await?;
        }
        Ok(options)
    }

    /// Replace the content at `path`, keeping its ACL and expiry tag.
    async fn rewrite(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let key = self.key(path)?;
        let expires_at = match self.expiry_of(&key).await {
            Ok(expires_at) => expires_at,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let options = self.keep_visibility(&key, PutOptions::default()).await?;
        self.put_object(&key, content, &options, expires_at.map(expiry_tagging))
            .await
    }

    /// Server-side copy carrying the source ACL. The expiry tag follows
    /// only when `carry_expiry` is set.
    async fn copy_object(&self, from: &StoragePath, to: &StoragePath, carry_expiry: bool) -> Result<()> {
        let from_key = self.key(from)?;
        let to_key = self.key(to)?;
        let visibility = self.acl_visibility(&from_key).await?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, &from_key))
            .key(&to_key)
            .acl(canned_acl(visibility))
            .tagging_directive(tagging_directive(carry_expiry))
            .send()
            .await
            .map_err(|e| s3_error(e, &from_key))?;
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<usize> {
        let objects = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| Error::InvalidInput(format!("Invalid object key: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Invalid delete request: {}", e)))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| s3_error(e, "batch delete"))?;

        let failed = output.errors().len();
        if failed > 0 {
            return Err(Error::Transport(format!(
                "{} of {} keys failed to delete",
                failed,
                keys.len()
            )));
        }
        Ok(keys.len())
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> &str {
        "s3"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            public_url: self.public_url.is_some(),
            temporary_url: true,
            metadata: true,
            directories: true,
            visibility: true,
            timed: true,
            native_append: false,
            streaming_upload: true,
        }
    }

    async fn put(&self, path: &StoragePath, content: Bytes, options: PutOptions) -> Result<()> {
        let key = self.key(path)?;
        debug!(bucket = %self.bucket, key = %key, size = content.len(), "Storing object");
        let options = self.keep_visibility(&key, options).await?;
        self.put_object(&key, content, &options, None).await
    }

    async fn put_stream(
        &self,
        path: &StoragePath,
        mut stream: ByteStream,
        options: PutOptions,
    ) -> Result<()> {
        let key = self.key(path)?;
        let options = self.keep_visibility(&key, options).await?;

        // Small uploads go out as a single PUT.
        let mut buffer = BytesMut::new();
        while buffer.len() < PART_SIZE {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => return self.put_object(&key, buffer.freeze(), &options, None).await,
            }
        }

        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key);
        if let Some(content_type) = content_type(&key, &options) {
            request = request.content_type(content_type);
        }
        if let Some(visibility) = options.visibility {
            request = request.acl(canned_acl(visibility));
        }
        let created = request.send().await.map_err(|e| s3_error(e, &key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Transport("S3 returned no upload id".to_string()))?
            .to_string();
        debug!(key = %key, upload_id = %upload_id, "Multipart upload started");

        let completed = match self.upload_parts(&key, &upload_id, buffer, stream).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| s3_error(e, &key))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = completed {
            if let Err(abort) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key = %key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, path: &StoragePath) -> Result<Bytes> {
        let key = self.key(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error(e, &key))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read S3 body: {}", e)))?
            .into_bytes();
        Ok(data)
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        // DeleteObject succeeds for absent keys; check first.
        self.head(path).await?;
        let key = self.key(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error(e, &key))?;
        debug!(key = %key, "Deleted object");
        Ok(())
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        exists_from(self.head(path).await)
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.copy_object(from, to, false).await
    }

    async fn move_file(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.copy_object(from, to, true).await?;
        let from_key = self.key(from)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&from_key)
            .send()
            .await
            .map_err(|e| s3_error(e, &from_key))?;
        Ok(())
    }

    async fn list_files(&self, dir: &StoragePath, recursive: bool) -> Result<Vec<StoragePath>> {
        let prefix = self.dir_prefix(dir);
        let (keys, _) = self.list_keys(&prefix, !recursive).await?;
        let mut files: Vec<StoragePath> = keys
            .iter()
            .filter(|key| !key.ends_with('/'))
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(StoragePath::parse)
            .collect::<Result<_>>()?;
        files.sort();
        Ok(files)
    }

    async fn list_directories(
        &self,
        dir: &StoragePath,
        recursive: bool,
    ) -> Result<Vec<StoragePath>> {
        let prefix = self.dir_prefix(dir);
        let (keys, prefixes) = self.list_keys(&prefix, !recursive).await?;

        let dirs: BTreeSet<StoragePath> = if recursive {
            let mut dirs = BTreeSet::new();
            for relative in keys.iter().filter_map(|key| key.strip_prefix(&prefix)) {
                // A marker `a/b/` names a/b itself; a file a/b/c.txt implies a and a/b.
                let is_marker = relative.ends_with('/');
                let path = StoragePath::parse(relative)?;
                let components = path.components();
                let depth = if is_marker {
                    components.len()
                } else {
                    components.len().saturating_sub(1)
                };
                for n in 1..=depth {
                    dirs.insert(StoragePath::from_components(components[..n].to_vec())?);
                }
            }
            dirs
        } else {
            prefixes
                .iter()
                .filter_map(|p| p.strip_prefix(&prefix))
                .map(StoragePath::parse)
                .collect::<Result<_>>()?
        };

        Ok(dirs.into_iter().filter(|d| !d.is_root()).collect())
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        let key = self.key(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error(e, &key))?;

        let stream = futures::stream::unfold(Some(output.body), |body| async move {
            let mut body = body?;
            match body.try_next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(Error::Transport(format!("S3 stream read error: {}", e))),
                    None,
                )),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn prepend(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, true).await?;
        self.rewrite(path, data).await
    }

    async fn append(&self, path: &StoragePath, content: Bytes) -> Result<()> {
        let data = concat_existing(self, path, &content, false).await?;
        self.rewrite(path, data).await
    }

    async fn url(&self, path: &StoragePath) -> Result<String> {
        let base = self
            .public_url
            .as_deref()
            .ok_or_else(|| Error::Unsupported("url requires public_url on the s3 driver".to_string()))?;
        Ok(join_url(base, &self.prefix.join_path(path)))
    }

    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_in: Duration,
        options: TemporaryUrlOptions,
    ) -> Result<String> {
        if options.is_constrained() {
            return Err(Error::Unsupported(
                "S3 presigned URLs cannot be bound to an IP or device".to_string(),
            ));
        }
        let key = self.key(path)?;
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| Error::InvalidInput(format!("Invalid presigning duration: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| s3_error(e, &key))?;

        debug!(key = %key, expires_in = ?expires_in, "Presigned URL generated");
        Ok(request.uri().to_string())
    }

    async fn metadata(&self, path: &StoragePath) -> Result<FileMetadata> {
        let output = self.head(path).await?;
        Ok(FileMetadata {
            path: path.clone(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            mime_type: output.content_type().map(String::from),
            last_modified: output
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            visibility: None,
        })
    }

    async fn make_directory(&self, path: &StoragePath) -> Result<()> {
        let marker = self.dir_prefix(path);
        if marker.is_empty() {
            return Ok(());
        }
        self.put_object(&marker, Bytes::new(), &PutOptions::default(), None)
            .await
    }

    async fn delete_directory(&self, path: &StoragePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the disk root".to_string()));
        }
        let prefix = self.dir_prefix(path);
        let (keys, _) = self.list_keys(&prefix, false).await?;
        if keys.is_empty() {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }

        let total = keys.len();
        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            match self.delete_keys(batch).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    warn!(prefix = %prefix, deleted, total, "Directory delete stopped part way");
                    return Err(Error::Transport(format!(
                        "Deleted {} of {} objects under {}: {}",
                        deleted, total, path, e
                    )));
                }
            }
        }
        debug!(prefix = %prefix, deleted, "Directory deleted");
        Ok(())
    }

    async fn visibility(&self, path: &StoragePath) -> Result<Visibility> {
        self.acl_visibility(&self.key(path)?).await
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let key = self.key(path)?;
        self.client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(&key)
            .acl(canned_acl(visibility))
            .send()
            .await
            .map_err(|e| s3_error(e, &key))?;
        Ok(())
    }

    async fn put_timed(
        &self,
        path: &StoragePath,
        content: Bytes,
        options: TimedOptions,
    ) -> Result<()> {
        let expires_at = resolve_expiry(&options, Utc::now())?;
        let key = self.key(path)?;
        let put_options = self.keep_visibility(&key, options.put_options()).await?;
        self.put_object(&key, content, &put_options, Some(expiry_tagging(expires_at)))
            .await
    }

    async fn delete_expired_under(&self, dir: &StoragePath) -> Result<usize> {
        let now = Utc::now();
        let prefix = self.dir_prefix(dir);
        let (keys, _) = self.list_keys(&prefix, false).await?;

        let mut due = Vec::new();
        for key in keys.iter().filter(|k| !k.ends_with('/')) {
            match self.expiry_of(key).await {
                Ok(Some(at)) if is_expired(at, now) => due.push(key.clone()),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut deleted = 0;
        for batch in due.chunks(DELETE_BATCH) {
            deleted += self.delete_keys(batch).await?;
        }
        info!(bucket = %self.bucket, deleted, "Expired objects swept");
        Ok(deleted)
    }
}

/// URL-encoded `Tagging` value of a timed object.
fn expiry_tagging(expires_at: i64) -> String {
    format!("{}={}", EXPIRES_AT_TAG, expires_at)
}

/// Moves keep the expiry tag; copies start without one.
fn tagging_directive(carry_expiry: bool) -> TaggingDirective {
    if carry_expiry {
        TaggingDirective::Copy
    } else {
        TaggingDirective::Replace
    }
}

fn canned_acl(visibility: Visibility) -> ObjectCannedAcl {
    match visibility {
        Visibility::Public => ObjectCannedAcl::PublicRead,
        Visibility::Private => ObjectCannedAcl::Private,
    }
}

fn content_type(key: &str, options: &PutOptions) -> Option<String> {
    options.content_type.clone().or_else(|| {
        mime_guess::from_path(key)
            .first()
            .map(|mime| mime.essence_str().to_string())
    })
}

/// `CopySource` value: bucket and URL-encoded key.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE))
}

/// Classify an S3 error code / HTTP status.
fn classify(code: Option<&str>, status: Option<u16>, context: &str, detail: String) -> Error {
    match code {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            return Error::NotFound(format!("Not found: {}", context))
        }
        Some("AccessDenied") => return Error::PermissionDenied(format!("Access denied: {}", context)),
        Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") | Some("ExpiredToken") => {
            return Error::Authentication(detail)
        }
        _ => {}
    }
    match status {
        Some(404) => Error::NotFound(format!("Not found: {}", context)),
        Some(401) => Error::Authentication(detail),
        Some(403) => Error::PermissionDenied(format!("Access denied: {}", context)),
        _ => Error::Transport(format!("S3 request failed for {}: {}", context, detail)),
    }
}

fn s3_error<E>(err: SdkError<E, HttpResponse>, context: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(String::from);
    classify(
        code.as_deref(),
        status,
        context,
        DisplayErrorContext(&err).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver(config: S3Config) -> S3Driver {
        let sdk = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url("http://127.0.0.1:9")
            .force_path_style(true)
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .build();
        S3Driver::new(Client::from_conf(sdk), config).unwrap()
    }

    fn config() -> S3Config {
        S3Config {
            bucket: "media".to_string(),
            root: Some("uploads".to_string()),
            ..S3Config::default()
        }
    }

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[test]
    fn test_keys_are_prefixed() {
        let driver = test_driver(config());
        assert_eq!(driver.key(&p("a/b.txt")).unwrap(), "uploads/a/b.txt");
        assert_eq!(driver.dir_prefix(&p("a")), "uploads/a/");
        assert_eq!(driver.dir_prefix(&p("")), "uploads/");
        assert!(driver.key(&p("")).is_err());

        let driver = test_driver(S3Config {
            bucket: "media".to_string(),
            ..S3Config::default()
        });
        assert_eq!(driver.dir_prefix(&p("")), "");
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let sdk = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        assert!(S3Driver::new(Client::from_conf(sdk), S3Config::default()).is_err());
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(
            copy_source("media", "uploads/my file+1.txt"),
            "media/uploads/my%20file%2B1.txt"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(classify(Some("NoSuchKey"), Some(404), "k", String::new()).is_not_found());
        assert!(classify(None, Some(404), "k", String::new()).is_not_found());
        assert!(matches!(
            classify(Some("InvalidAccessKeyId"), Some(403), "k", String::new()),
            Error::Authentication(_)
        ));
        assert!(matches!(
            classify(Some("AccessDenied"), Some(403), "k", String::new()),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            classify(Some("SlowDown"), Some(503), "k", String::new()),
            Error::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_public_url() {
        let mut config = config();
        config.public_url = Some("https://cdn.example.com".to_string());
        let driver = test_driver(config);
        assert_eq!(
            driver.url(&p("a b.png")).await.unwrap(),
            "https://cdn.example.com/uploads/a%20b.png"
        );

        let driver = test_driver(self::config());
        assert_eq!(
            driver.url(&p("a.png")).await.unwrap_err().kind(),
            stowage_common::ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn test_presigned_url() {
        let driver = test_driver(config());
        let url = driver
            .temporary_url(&p("a.txt"), Duration::from_secs(300), TemporaryUrlOptions::default())
            .await
            .unwrap();

        assert!(url.contains("/media/uploads/a.txt"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=300"));
    }

    #[tokio::test]
    async fn test_presign_rejects_constraints() {
        let driver = test_driver(config());
        let err = driver
            .temporary_url(
                &p("a.txt"),
                Duration::from_secs(300),
                TemporaryUrlOptions {
                    ip: Some("10.0.0.1".parse().unwrap()),
                    device_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stowage_common::ErrorKind::Unsupported);
    }

    #[test]
    fn test_expiry_travels_on_move_only() {
        assert_eq!(expiry_tagging(1_700_000_000_000), "expires-at=1700000000000");
        assert_eq!(tagging_directive(true), TaggingDirective::Copy);
        assert_eq!(tagging_directive(false), TaggingDirective::Replace);
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(
            content_type("x/photo.jpg", &PutOptions::default()).as_deref(),
            Some("image/jpeg")
        );
        let options = PutOptions {
            content_type: Some("text/csv".to_string()),
            ..PutOptions::default()
        };
        assert_eq!(content_type("x/photo.jpg", &options).as_deref(), Some("text/csv"));
    }

    #[test]
    fn test_config_deserialize() {
        let config: S3Config = serde_json::from_value(serde_json::json!({
            "bucket": "media",
            "region": "eu-west-1",
            "endpoint": "http://localhost:9000",
            "force_path_style": true
        }))
        .unwrap();
        assert_eq!(config.bucket, "media");
        assert!(config.force_path_style);
        assert!(config.access_key_id.is_none());
    }
}
