//! Azure AD Authentication module
//!
//! Implements the OAuth2 client credentials flow for app-only access to
//! Dynamics 365. `TokenProvider` keeps one token in memory and refreshes it
//! single-flight: concurrent callers that find the token stale wait on the
//! same exchange instead of each starting their own.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Tokens are treated as expired this long before their real expiry
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token request failed: {0}")]
    TokenRequestFailed(String),

    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    #[error("Token parse error: {0}")]
    ParseError(String),

    #[error("CRM rejected the credentials (HTTP {0})")]
    Rejected(u16),
}

/// Bearer token held in process memory only
#[derive(Clone)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AuthToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + SAFETY_MARGIN < self.expires_at
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Performs one credential exchange against an identity provider
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self) -> Result<AuthToken, AuthError>;
}

/// Token response from Azure AD
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Client credentials exchange against the Azure AD v2 token endpoint
pub struct AzureAdExchange {
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    scope: String,
    http_client: Client,
}

impl AzureAdExchange {
    pub fn new(
        authority_host: &str,
        tenant_id: String,
        client_id: String,
        client_secret: String,
        resource: &str,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        Ok(Self {
            authority_host: authority_host.trim_end_matches('/').to_string(),
            tenant_id,
            client_id,
            client_secret,
            scope: scope_for_resource(resource),
            http_client,
        })
    }

    /// Get the token endpoint URL for this tenant
    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        )
    }
}

#[async_trait]
impl CredentialExchange for AzureAdExchange {
    async fn exchange(&self) -> Result<AuthToken, AuthError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http_client
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.without_url().to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Token request failed: {} - {}", status, body);
            return Err(AuthError::TokenRequestFailed(format!(
                "Status: {}",
                status
            )));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            AuthError::ParseError(format!("Failed to parse token response: {}", e))
        })?;

        tracing::info!(
            "Token acquired successfully, expires in {} seconds",
            token_response.expires_in
        );

        Ok(AuthToken {
            value: token_response.access_token,
            expires_at: Instant::now() + Duration::from_secs(token_response.expires_in),
        })
    }
}

/// Caches a bearer token and refreshes it on demand
pub struct TokenProvider {
    exchange: Arc<dyn CredentialExchange>,
    token: RwLock<Option<AuthToken>>,
    refresh: Mutex<()>,
}

impl TokenProvider {
    pub fn new(exchange: Arc<dyn CredentialExchange>) -> Self {
        Self {
            exchange,
            token: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return the cached token, or acquire a fresh one if it is close to expiry
    pub async fn get_token(&self) -> Result<AuthToken, AuthError> {
        if let Some(token) = self.fresh_token().await {
            tracing::debug!("Using cached token");
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        tracing::info!("Acquiring new access token");
        let token = self.exchange.exchange().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token if it is still the one the caller saw rejected
    pub async fn invalidate(&self, rejected: &AuthToken) {
        let mut cache = self.token.write().await;
        if cache.as_ref().map(|t| t.value == rejected.value).unwrap_or(false) {
            *cache = None;
        }
    }

    async fn fresh_token(&self) -> Option<AuthToken> {
        let cache = self.token.read().await;
        cache
            .as_ref()
            .filter(|t| t.is_fresh(Instant::now()))
            .cloned()
    }
}

/// Build the `.default` scope for a resource URL
pub fn scope_for_resource(resource: &str) -> String {
    if resource.ends_with('/') {
        format!("{}.default", resource)
    } else {
        format!("{}/.default", resource)
    }
}
