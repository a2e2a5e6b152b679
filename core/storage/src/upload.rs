//! Helpers for storing uploaded files.
//!
//! The HTTP layer extracts the bytes (or a stream) and the client-supplied
//! name from a request, then calls [`store_upload`] with a disk driver. No
//! request types cross into this module.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use stowage_common::{Error, Result, StoragePath};

use crate::driver::{ByteStream, PutOptions, StorageDriver};

/// Picks the stored filename of an upload.
pub trait FilenameStrategy: Send + Sync {
    /// Filename (one path component) for an upload named `original`.
    fn filename(&self, original: Option<&str>) -> String;
}

/// Random UUID, keeping the original extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidFilename;

impl FilenameStrategy for UuidFilename {
    fn filename(&self, original: Option<&str>) -> String {
        with_extension(Uuid::new_v4().to_string(), original)
    }
}

/// The client's filename, sanitized. Falls back to a UUID when nothing
/// usable is left.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalFilename;

impl FilenameStrategy for OriginalFilename {
    fn filename(&self, original: Option<&str>) -> String {
        match original.map(sanitize_filename) {
            Some(name) if !name.is_empty() => name,
            _ => UuidFilename.filename(original),
        }
    }
}

/// Upload time with a short random suffix, keeping the extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampFilename;

impl FilenameStrategy for TimestampFilename {
    fn filename(&self, original: Option<&str>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        let stem = format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), &suffix[..8]);
        with_extension(stem, original)
    }
}

/// Strip directories and anything outside `[A-Za-z0-9._-]`; whitespace
/// becomes `_` and leading dots are dropped.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

fn with_extension(stem: String, original: Option<&str>) -> String {
    let extension = original
        .map(sanitize_filename)
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty());
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

/// Limits applied before anything is written.
#[derive(Debug, Clone, Default)]
pub struct UploadRules {
    /// Maximum size in bytes.
    pub max_size: Option<u64>,
    /// Accepted MIME types; `type/*` matches a whole family. Empty accepts
    /// everything.
    pub allowed_mime_types: Vec<String>,
}

impl UploadRules {
    fn check_size(&self, size: u64) -> Result<()> {
        match self.max_size {
            Some(max) if size > max => Err(Error::Validation(format!(
                "Upload of {} bytes exceeds the {} byte limit",
                size, max
            ))),
            _ => Ok(()),
        }
    }

    fn check_mime(&self, mime: Option<&str>) -> Result<()> {
        if self.allowed_mime_types.is_empty() {
            return Ok(());
        }
        let mime = mime.unwrap_or("application/octet-stream");
        let allowed = self.allowed_mime_types.iter().any(|pattern| {
            match pattern.strip_suffix("/*") {
                Some(family) => mime
                    .split_once('/')
                    .is_some_and(|(top, _)| top.eq_ignore_ascii_case(family)),
                None => pattern.eq_ignore_ascii_case(mime),
            }
        });
        if allowed {
            Ok(())
        } else {
            Err(Error::Validation(format!("File type {} is not allowed", mime)))
        }
    }
}

/// Payload of an upload.
pub enum UploadBody {
    Bytes(Bytes),
    /// A stream with an optional declared length.
    Stream { stream: ByteStream, size: Option<u64> },
}

/// One uploaded file as handed over by the HTTP layer.
pub struct UploadedContent {
    /// Client-supplied filename.
    pub original_name: Option<String>,
    /// Declared content type; guessed from `original_name` when absent.
    pub content_type: Option<String>,
    pub body: UploadBody,
}

impl UploadedContent {
    pub fn bytes(original_name: Option<&str>, data: impl Into<Bytes>) -> Self {
        Self {
            original_name: original_name.map(str::to_string),
            content_type: None,
            body: UploadBody::Bytes(data.into()),
        }
    }

    pub fn stream(original_name: Option<&str>, stream: ByteStream, size: Option<u64>) -> Self {
        Self {
            original_name: original_name.map(str::to_string),
            content_type: None,
            body: UploadBody::Stream { stream, size },
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn mime_type(&self) -> Option<String> {
        self.content_type.clone().or_else(|| {
            self.original_name
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first())
                .map(|mime| mime.essence_str().to_string())
        })
    }
}

/// Fail the stream once more than `max` bytes went through it.
fn limit_stream(stream: ByteStream, max: u64) -> ByteStream {
    let mut seen: u64 = 0;
    Box::pin(stream.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen > max {
            return Err(Error::Validation(format!(
                "Upload exceeds the {} byte limit",
                max
            )));
        }
        Ok(chunk)
    }))
}

/// Validate `upload` and store it under `dir`.
///
/// The filename comes from `per_call` when given, `global` otherwise.
/// Returns the stored path.
///
/// # Errors
/// - `Validation` if a rule rejects the upload; nothing is written for
///   byte bodies or declared stream sizes, and a stream found too large
///   while writing fails the write
/// - Any error from the driver
pub async fn store_upload(
    driver: &dyn StorageDriver,
    dir: &StoragePath,
    upload: UploadedContent,
    per_call: Option<&dyn FilenameStrategy>,
    global: &dyn FilenameStrategy,
    rules: &UploadRules,
    mut options: PutOptions,
) -> Result<StoragePath> {
    let mime = upload.mime_type();
    rules.check_mime(mime.as_deref())?;

    let strategy = per_call.unwrap_or(global);
    let filename = strategy.filename(upload.original_name.as_deref());
    let path = dir.join(&filename)?;
    if options.content_type.is_none() {
        options.content_type = mime;
    }

    match upload.body {
        UploadBody::Bytes(data) => {
            rules.check_size(data.len() as u64)?;
            debug!(path = %path, size = data.len(), "Storing upload");
            driver.put(&path, data, options).await?;
        }
        UploadBody::Stream { stream, size } => {
            if let Some(size) = size {
                rules.check_size(size)?;
            }
            let stream = match rules.max_size {
                Some(max) => limit_stream(stream, max),
                None => stream,
            };
            debug!(path = %path, "Storing streamed upload");
            driver.put_stream(&path, stream, options).await?;
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDriver;
    use crate::local::{LocalConfig, LocalDriver};
    use stowage_common::ErrorKind;
    use tempfile::TempDir;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    struct Fixed(&'static str);

    impl FilenameStrategy for Fixed {
        fn filename(&self, _original: Option<&str>) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\My File.PDF"), "My_File.PDF");
        assert_eq!(sanitize_filename(".htaccess"), "htaccess");
        assert_eq!(sanitize_filename("résumé.txt"), "rsum.txt");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn test_strategies_keep_extension() {
        let name = UuidFilename.filename(Some("photo.JPG"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), 36 + 4);

        assert!(!UuidFilename.filename(None).contains('.'));
        assert_eq!(OriginalFilename.filename(Some("a b.txt")), "a_b.txt");
        assert!(OriginalFilename.filename(Some("///")).len() >= 36);
        assert!(TimestampFilename.filename(Some("x.png")).ends_with(".png"));
    }

    #[test]
    fn test_mime_rules() {
        let rules = UploadRules {
            max_size: None,
            allowed_mime_types: vec!["image/*".to_string(), "application/pdf".to_string()],
        };
        assert!(rules.check_mime(Some("image/png")).is_ok());
        assert!(rules.check_mime(Some("application/pdf")).is_ok());
        assert!(rules.check_mime(Some("text/plain")).is_err());
        assert!(rules.check_mime(None).is_err());
        assert!(UploadRules::default().check_mime(None).is_ok());
    }

    #[tokio::test]
    async fn test_per_call_strategy_wins() {
        let driver = BufferDriver::new();
        let upload = UploadedContent::bytes(Some("report.pdf"), "data");

        let path = store_upload(
            &driver,
            &p("docs"),
            upload,
            Some(&Fixed("call.pdf")),
            &Fixed("global.pdf"),
            &UploadRules::default(),
            PutOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(path, p("docs/call.pdf"));
        assert_eq!(driver.get(&path).await.unwrap(), Bytes::from("data"));
        let metadata = driver.metadata(&path).await.unwrap();
        assert_eq!(metadata.mime_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn test_global_strategy_by_default() {
        let driver = BufferDriver::new();
        let path = store_upload(
            &driver,
            &StoragePath::root(),
            UploadedContent::bytes(Some("a.txt"), "x"),
            None,
            &Fixed("global.txt"),
            &UploadRules::default(),
            PutOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(path, p("global.txt"));
    }

    #[tokio::test]
    async fn test_rejected_upload_writes_nothing() {
        let driver = BufferDriver::new();
        let rules = UploadRules {
            max_size: Some(3),
            allowed_mime_types: vec!["text/plain".to_string()],
        };

        let too_big = store_upload(
            &driver,
            &StoragePath::root(),
            UploadedContent::bytes(Some("a.txt"), "too long"),
            None,
            &UuidFilename,
            &rules,
            PutOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(too_big.kind(), ErrorKind::ValidationFailure);

        let wrong_type = store_upload(
            &driver,
            &StoragePath::root(),
            UploadedContent::bytes(Some("a.exe"), "ok"),
            None,
            &UuidFilename,
            &rules,
            PutOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(wrong_type, Error::Validation(_)));
        assert!(driver.is_empty().await);
    }

    #[tokio::test]
    async fn test_oversized_stream_leaves_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let driver = LocalDriver::new(LocalConfig::new(temp_dir.path())).unwrap();
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from("abc")), Ok(Bytes::from("def"))];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));

        let err = store_upload(
            &driver,
            &StoragePath::root(),
            UploadedContent::stream(Some("big.bin"), stream, None),
            Some(&Fixed("big.bin")),
            &UuidFilename,
            &UploadRules {
                max_size: Some(4),
                allowed_mime_types: Vec::new(),
            },
            PutOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(!driver.exists(&p("big.bin")).await.unwrap());
        assert!(driver
            .list_files(&StoragePath::root(), true)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_declared_stream_size_checked_up_front() {
        let driver = BufferDriver::new();
        let stream: ByteStream = Box::pin(futures::stream::empty());
        let err = store_upload(
            &driver,
            &StoragePath::root(),
            UploadedContent::stream(Some("v.mp4"), stream, Some(100)).with_content_type("video/mp4"),
            None,
            &UuidFilename,
            &UploadRules {
                max_size: Some(10),
                allowed_mime_types: vec!["video/*".to_string()],
            },
            PutOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
