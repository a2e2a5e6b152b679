//! OAuth2 token management shared by the Dropbox and Google Drive drivers.

use chrono::{DateTime, Duration, Utc};
use oauth2::{basic::BasicClient, AuthUrl, ClientId, ClientSecret, TokenResponse, TokenUrl};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use stowage_common::{Error, Result};

/// Token endpoints of a provider.
#[derive(Debug, Clone, Copy)]
pub struct OAuthEndpoints {
    pub auth_url: &'static str,
    pub token_url: &'static str,
}

pub const GOOGLE: OAuthEndpoints = OAuthEndpoints {
    auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
    token_url: "https://oauth2.googleapis.com/token",
};

pub const DROPBOX: OAuthEndpoints = OAuthEndpoints {
    auth_url: "https://www.dropbox.com/oauth2/authorize",
    token_url: "https://api.dropboxapi.com/oauth2/token",
};

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When the access token expires. `None` means it does not.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Tokens {
    /// A long-lived access token without refresh.
    pub fn fixed(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at
            .is_some_and(|at| at < Utc::now() + Duration::minutes(5))
    }
}

/// Application credentials used for refreshing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Exchanges refresh tokens at a provider's token endpoint.
pub struct AuthManager {
    client: BasicClient,
}

impl AuthManager {
    pub fn new(endpoints: OAuthEndpoints, credentials: &ClientCredentials) -> Result<Self> {
        let client = BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            credentials.client_secret.clone().map(ClientSecret::new),
            AuthUrl::new(endpoints.auth_url.to_string())
                .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            Some(
                TokenUrl::new(endpoints.token_url.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            ),
        );

        Ok(Self { client })
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid or revoked refresh token
    /// - Network errors
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        use oauth2::reqwest::async_http_client;
        use oauth2::RefreshToken;

        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

        // Providers may or may not rotate the refresh token
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        let expires_in = token_result
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(3600));
        let expires_at =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));

        Ok(Tokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: Some(new_refresh_token),
            expires_at: Some(expires_at),
        })
    }
}

/// Hands out a valid access token, refreshing when it is about to expire.
pub struct TokenManager {
    auth_manager: Option<AuthManager>,
    tokens: RwLock<Tokens>,
}

impl TokenManager {
    /// Tokens that can be refreshed through `auth_manager`.
    pub fn new(auth_manager: AuthManager, tokens: Tokens) -> Self {
        Self {
            auth_manager: Some(auth_manager),
            tokens: RwLock::new(tokens),
        }
    }

    /// Tokens used as-is; once expired every call fails with
    /// `Error::Authentication`.
    pub fn fixed(tokens: Tokens) -> Self {
        Self {
            auth_manager: None,
            tokens: RwLock::new(tokens),
        }
    }

    /// Build from optional client credentials.
    pub fn from_config(
        endpoints: OAuthEndpoints,
        client: Option<&ClientCredentials>,
        tokens: Tokens,
    ) -> Result<Self> {
        match client {
            Some(credentials) if tokens.refresh_token.is_some() => {
                Ok(Self::new(AuthManager::new(endpoints, credentials)?, tokens))
            }
            _ => Ok(Self::fixed(tokens)),
        }
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - Token expired and cannot be refreshed
    /// - Token refresh failed
    pub async fn access_token(&self) -> Result<String> {
        let tokens = self.tokens.read().await;
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }
        drop(tokens);

        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        let (Some(auth_manager), Some(refresh_token)) =
            (&self.auth_manager, tokens.refresh_token.clone())
        else {
            return Err(Error::Authentication(
                "Access token expired and no refresh credentials are configured".to_string(),
            ));
        };

        info!("Refreshing expired access token");
        *tokens = auth_manager.refresh_token(&refresh_token).await?;
        Ok(tokens.access_token.clone())
    }

    /// Current tokens, e.g. to persist a rotated refresh token.
    pub async fn tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }
}
