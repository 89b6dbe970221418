//! Bearer token acquisition for the EKM RPC channel. Token issuance itself
//! is external; the session only needs "a token for this audience".

use async_trait::async_trait;

use stet_core::{StetError, StetResult};

/// Supplies bearer tokens scoped to an audience of the form
/// `<scheme>://<host>`. Tokens ride in RPC metadata and never enter the
/// inner TLS stream.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self, audience: &str) -> StetResult<String>;
}

/// Serves one pre-issued token, e.g. injected via environment or file.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self, audience: &str) -> StetResult<String> {
        if self.token.is_empty() {
            return Err(StetError::TokenIssuance(format!(
                "no token configured for audience {audience}"
            )));
        }
        Ok(self.token.clone())
    }
}
