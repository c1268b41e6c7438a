//! Bearer token lifecycle
//!
//! The access token lives in KV under one well-known key with a TTL a little
//! shorter than the provider's declared lifetime. On a miss it is re-minted
//! from the stored refresh credential.
//!
//! Refreshes are not serialized: concurrent callers that all miss may each
//! hit the token endpoint. The last write wins and every minted token is valid.

use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::errors::AuthError;
use super::transport::{ApiRequest, HttpTransport, AUTHORIZATION};
use crate::kv::Kv;

pub const ACCESS_TOKEN_KEY: &str = "auth:access_token";
pub const REFRESH_TOKEN_KEY: &str = "auth:refresh_token";

/// Seconds shaved off the provider lifetime before the cached token lapses
pub const TOKEN_SAFETY_MARGIN_SECS: u64 = 300;

/// Provider error code for a revoked or expired refresh credential
const REVOKED_GRANT: &str = "invalid_grant";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// KV TTL for a token the provider says lives `expires_in` seconds
fn cache_ttl(expires_in: u64) -> u64 {
    let ttl = if expires_in > TOKEN_SAFETY_MARGIN_SECS * 2 {
        expires_in - TOKEN_SAFETY_MARGIN_SECS
    } else {
        expires_in / 2
    };
    ttl.max(1)
}

#[derive(Clone)]
pub struct TokenManager {
    kv: Kv,
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TokenManager {
    pub fn new(
        kv: Kv,
        transport: Arc<dyn HttpTransport>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            transport,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Cached access token, or a freshly minted one
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        match self.kv.get::<String>(ACCESS_TOKEN_KEY).await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read cached access token, refreshing"),
        }

        let refresh_token = match self.kv.get::<String>(REFRESH_TOKEN_KEY).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(AuthError::NotConnected),
            Err(e) => {
                warn!(error = %e, "Failed to read refresh credential");
                return Err(AuthError::NotConnected);
            }
        };

        self.refresh(&refresh_token).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        info!("Refreshing access token...");

        let mut request = ApiRequest::post_form(
            self.token_url.as_str(),
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
        );
        if !self.client_id.is_empty() {
            let credentials = format!("{}:{}", self.client_id, self.client_secret);
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            request.set_header(AUTHORIZATION, format!("Basic {}", encoded));
        }

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.is_success() {
            let provider_error = response.json::<ProviderError>().ok();
            if provider_error.as_ref().map(|e| e.error.as_str()) == Some(REVOKED_GRANT) {
                warn!("Refresh credential revoked, clearing stored session");
                if let Err(e) = self.kv.del(&[REFRESH_TOKEN_KEY, ACCESS_TOKEN_KEY]).await {
                    warn!(error = %e, "Failed to clear revoked credential");
                }
                return Err(AuthError::SessionExpired);
            }

            let detail = match provider_error {
                Some(ProviderError {
                    error,
                    error_description: Some(description),
                }) => format!("{}: {}", error, description),
                Some(ProviderError { error, .. }) => error,
                None => format!("HTTP {}: {}", response.status, response.body),
            };
            return Err(AuthError::AuthenticationFailed(detail));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| AuthError::AuthenticationFailed(format!("malformed token response: {}", e)))?;

        let ttl = cache_ttl(token.expires_in);
        if let Err(e) = self.kv.set(ACCESS_TOKEN_KEY, &token.access_token, Some(ttl)).await {
            warn!(error = %e, "Failed to cache access token");
        }

        info!(expires_in = token.expires_in, cache_ttl = ttl, "Access token refreshed successfully");
        Ok(token.access_token)
    }

    /// Drop the cached access token so the next call refreshes
    pub async fn invalidate_access_token(&self) {
        debug!("Invalidating cached access token");
        if let Err(e) = self.kv.del(&[ACCESS_TOKEN_KEY]).await {
            warn!(error = %e, "Failed to invalidate access token");
        }
    }

    /// Persist the long-lived credential obtained from authorization
    pub async fn store_refresh_token(&self, refresh_token: &str) -> Result<(), crate::kv::KvError> {
        self.kv.set(REFRESH_TOKEN_KEY, refresh_token, None).await?;
        self.kv.del(&[ACCESS_TOKEN_KEY]).await?;
        info!("Stored refresh credential");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.kv.exists(REFRESH_TOKEN_KEY).await, Ok(true))
    }

    /// Forget both the refresh credential and the cached access token
    pub async fn disconnect(&self) -> Result<(), crate::kv::KvError> {
        self.kv.del(&[REFRESH_TOKEN_KEY, ACCESS_TOKEN_KEY]).await?;
        info!("Disconnected storage account");
        Ok(())
    }
}
