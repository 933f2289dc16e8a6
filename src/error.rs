//! Error taxonomy surfaced by CRM queries and tool calls

use crate::auth::AuthError;
use crate::config::ConfigError;
use thiserror::Error;

/// Errors a CRM query can surface to the tool layer
#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("CRM returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Rate limited (429): retry after {0} seconds")]
    RateLimited(u64),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ambiguous name: {0}")]
    Ambiguous(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CrmError {
    /// Stable taxonomy string reported to the assistant runtime
    pub fn kind(&self) -> &'static str {
        match self {
            CrmError::Config(_) => "config_error",
            CrmError::Auth(_) => "auth_error",
            CrmError::Network(_) => "network_error",
            CrmError::Remote { .. } => "remote_error",
            CrmError::RateLimited(_) => "rate_limited",
            CrmError::Parse(_) => "parse_error",
            CrmError::NotFound(_) => "not_found",
            CrmError::Ambiguous(_) => "ambiguous",
            CrmError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

impl From<reqwest::Error> for CrmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() && !err.is_timeout() && !err.is_body() {
            CrmError::Parse(err.to_string())
        } else {
            // Strip the URL so query strings never reach the caller
            CrmError::Network(err.without_url().to_string())
        }
    }
}
