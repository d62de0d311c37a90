//! Client side of the external identity/authorization service.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

/// Shared-secret header sent to the platform's internal hook endpoints.
pub const AUTH_HEADER: &str = "X-Builder-Auth";

/// Owner of a public key as reported by the identity service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeyOwner {
    pub username: String,
    #[serde(rename = "apps", default)]
    pub repositories: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("key is not registered")]
    UnknownKey,
    #[error("identity service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity service answered with status {0}")]
    Status(u16),
    #[error("identity service response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn lookup(&self, fingerprint: &str) -> Result<KeyOwner, IdentityError>;
}

/// HTTP identity lookup: `GET {base}/v2/hooks/key/{fingerprint}`.
///
/// No retries happen here; a failed lookup fails the handshake.
pub struct HttpIdentityService {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpIdentityService {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn lookup(&self, fingerprint: &str) -> Result<KeyOwner, IdentityError> {
        let url = format!("{}/v2/hooks/key/{}", self.base_url, fingerprint);
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header(AUTH_HEADER, token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(IdentityError::UnknownKey),
            status if status.is_success() => response
                .json::<KeyOwner>()
                .await
                .map_err(|err| IdentityError::Decode(err.to_string())),
            status => Err(IdentityError::Status(status.as_u16())),
        }
    }
}

/// Fixed fingerprint table, for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityService {
    owners: HashMap<String, KeyOwner>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(
        mut self,
        fingerprint: impl Into<String>,
        username: impl Into<String>,
        repositories: &[&str],
    ) -> Self {
        self.owners.insert(
            fingerprint.into(),
            KeyOwner {
                username: username.into(),
                repositories: repositories.iter().map(|r| r.to_string()).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn lookup(&self, fingerprint: &str) -> Result<KeyOwner, IdentityError> {
        self.owners
            .get(fingerprint)
            .cloned()
            .ok_or(IdentityError::UnknownKey)
    }
}
