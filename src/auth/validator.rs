use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// What the token validation service says about a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default, alias = "userId", alias = "subjectId")]
    pub subject_id: Option<String>,
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,
}

impl TokenInfo {
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Token validation collaborator. An `Err` means the collaborator could not
/// answer; an unknown or expired token is `Ok` with `valid == false`.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenInfo>;
}

/// Validates tokens against `GET {validate_url}?token=<token>`.
pub struct IntrospectionValidator {
    client: reqwest::Client,
    validate_url: String,
}

impl IntrospectionValidator {
    pub fn new(validate_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            validate_url: validate_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenValidator for IntrospectionValidator {
    async fn validate(&self, token: &str) -> Result<TokenInfo> {
        let url = format!("{}?token={}", self.validate_url, urlencoding::encode(token));
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "auth: token rejected by validator");
            return Ok(TokenInfo::invalid());
        }

        let info: TokenInfo = resp.json().await?;
        Ok(info)
    }
}

/// Used when no validation URL is configured: every token is invalid.
pub struct RejectAllValidator;

#[async_trait]
impl TokenValidator for RejectAllValidator {
    async fn validate(&self, _token: &str) -> Result<TokenInfo> {
        Ok(TokenInfo::invalid())
    }
}
