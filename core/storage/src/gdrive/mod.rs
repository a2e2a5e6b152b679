//! Google Drive storage driver.
//!
//! - OAuth2 authentication with automatic token refresh (see `crate::oauth`)
//! - Resumable uploads for large files
//! - Path resolution by walking folder names, no id cache

pub mod client;
pub mod driver;

pub use client::DriveClient;
pub use driver::{GDriveConfig, GDriveDriver};
