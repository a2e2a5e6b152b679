//! Process-local temporary links for drivers without native URL signing.
//!
//! A link is an opaque random token mapped to a path, an absolute expiry
//! and optional IP / device constraints. The table lives in memory only:
//! restarting the process invalidates every outstanding link. Callers
//! that need links to survive a restart must persist tokens themselves.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use stowage_common::{Error, Result, StoragePath};

use crate::driver::TemporaryUrlOptions;

/// Request header carrying the device identifier checked against
/// device-bound links.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

/// One issued link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryLink {
    pub path: StoragePath,
    pub expires_at: DateTime<Utc>,
    pub ip: Option<IpAddr>,
    pub device_id: Option<String>,
}

impl TemporaryLink {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn admits(&self, request: &LinkRequest) -> bool {
        if let Some(ip) = self.ip {
            if request.ip != Some(ip) {
                return false;
            }
        }
        if let Some(device_id) = &self.device_id {
            if request.device_id.as_deref() != Some(device_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Connection facts of an inbound request presenting a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkRequest {
    /// Peer address of the connection.
    pub ip: Option<IpAddr>,
    /// Value of the `X-Device-Id` header.
    pub device_id: Option<String>,
}

impl LinkRequest {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            device_id: None,
        }
    }
}

/// Token table for temporary links.
///
/// Construct one per disk (or share one through an `Arc`); there is no
/// global instance.
#[derive(Debug, Default)]
pub struct TemporaryLinkStore {
    links: RwLock<HashMap<String, TemporaryLink>>,
}

impl TemporaryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `path` valid for `expires_in`.
    pub async fn issue(
        &self,
        path: &StoragePath,
        expires_in: Duration,
        options: TemporaryUrlOptions,
    ) -> Result<String> {
        let expires_in = chrono::Duration::from_std(expires_in)
            .map_err(|e| Error::InvalidInput(format!("Expiry out of range: {}", e)))?;

        let token = generate_token();
        let link = TemporaryLink {
            path: path.clone(),
            expires_at: Utc::now() + expires_in,
            ip: options.ip,
            device_id: options.device_id,
        };

        debug!(path = %path, expires_at = %link.expires_at, "Temporary link issued");
        self.links.write().await.insert(token.clone(), link);
        Ok(token)
    }

    /// Validate `token` for `request` and return the linked path.
    ///
    /// Unknown, expired and constraint-mismatched tokens all give `None`.
    /// Expired tokens are evicted here.
    pub async fn resolve(&self, token: &str, request: &LinkRequest) -> Option<StoragePath> {
        let now = Utc::now();
        {
            let links = self.links.read().await;
            match links.get(token) {
                None => return None,
                Some(link) if !link.is_expired(now) => {
                    return link.admits(request).then(|| link.path.clone());
                }
                Some(_) => {}
            }
        }

        let mut links = self.links.write().await;
        if links.get(token).is_some_and(|link| link.is_expired(now)) {
            links.remove(token);
        }
        None
    }

    /// Revoke a token. Returns whether it existed.
    pub async fn revoke(&self, token: &str) -> bool {
        self.links.write().await.remove(token).is_some()
    }

    /// Drop every expired token and return how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut links = self.links.write().await;
        let before = links.len();
        links.retain(|_, link| !link.is_expired(now));
        before - links.len()
    }

    /// Number of live (not yet evicted) tokens.
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
