//! Common utilities and types shared across Stowage crates.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring every driver reports the same error kinds and agrees on what a
//! logical storage path looks like.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{StoragePath, Visibility};
