//! Storage drivers for Stowage.
//!
//! One async capability contract ([`StorageDriver`]) implemented by every
//! backend (local filesystem, in-memory buffer, S3, FTP, SFTP, Dropbox,
//! Google Drive) and by two wrappers (scoped prefix, read-only), plus a
//! registry that builds named disks from configuration.
//!
//! # Design Principles
//! - Optional operations fail with `Error::Unsupported`, never a silent no-op
//! - `exists` is the only call that turns NotFound into a value
//! - Writes either fully land or leave the prior state
//! - Temporary links and expirations are per-backend strategies

pub mod buffer;
pub mod driver;
pub mod dropbox;
pub mod expiration;
pub mod ftp;
pub mod gdrive;
pub mod local;
pub mod oauth;
pub mod readonly;
pub mod registry;
pub mod s3;
pub mod scoped;
pub mod sftp;
pub mod temporary;
pub mod upload;

#[cfg(test)]
mod contract_tests;

pub use buffer::BufferDriver;
pub use driver::{
    ByteStream, Capabilities, FileMetadata, PutOptions, StorageDriver, TemporaryUrlOptions,
    TimedOptions, DEFAULT_TEMPORARY_URL_TTL,
};
pub use dropbox::{DropboxConfig, DropboxDriver};
pub use ftp::{FtpConfig, FtpDriver};
pub use gdrive::{GDriveConfig, GDriveDriver};
pub use local::{LocalConfig, LocalDriver};
pub use oauth::{ClientCredentials, Tokens};
pub use readonly::ReadOnlyDriver;
pub use registry::{DiskConfig, DiskRegistry, ResolvedLink, StorageConfig, StorageDisk, StorageDiskConfig};
pub use s3::{S3Config, S3Driver};
pub use scoped::ScopedDriver;
pub use sftp::{SftpConfig, SftpDriver};
pub use temporary::{LinkRequest, TemporaryLinkStore, DEVICE_ID_HEADER};
pub use upload::{
    store_upload, FilenameStrategy, OriginalFilename, TimestampFilename, UploadRules,
    UploadedContent, UuidFilename,
};
