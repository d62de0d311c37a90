//! Public-key authentication gateway.
//!
//! Turns a presented SSH key into a [`Permissions`] set by fingerprinting it
//! and asking the external identity service who owns it.

pub mod fingerprint;
pub mod identity;

use std::collections::HashSet;
use std::sync::Arc;

use russh::keys::PublicKey;

pub use fingerprint::{fingerprint, fingerprint_blob};
pub use identity::{HttpIdentityService, IdentityError, IdentityService, KeyOwner, StaticIdentityService};

/// What an authenticated key may do. Read-only for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub username: String,
    pub fingerprint: String,
    pub repositories: HashSet<String>,
}

impl Permissions {
    pub fn allows(&self, repository: &str) -> bool {
        self.repositories.contains(repository)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("public key could not be encoded: {0}")]
    KeyEncoding(String),
    #[error("unknown public key {fingerprint}")]
    UnknownKey { fingerprint: String },
    #[error("identity lookup for {fingerprint} failed: {source}")]
    Lookup {
        fingerprint: String,
        #[source]
        source: IdentityError,
    },
}

impl AuthError {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            AuthError::KeyEncoding(_) => None,
            AuthError::UnknownKey { fingerprint } | AuthError::Lookup { fingerprint, .. } => {
                Some(fingerprint)
            }
        }
    }
}

#[derive(Clone)]
pub struct AuthGateway {
    identity: Arc<dyn IdentityService>,
}

impl AuthGateway {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    pub async fn authenticate_key(&self, key: &PublicKey) -> Result<Permissions, AuthError> {
        let fingerprint = fingerprint(key)?;
        self.authenticate_fingerprint(fingerprint).await
    }

    async fn authenticate_fingerprint(&self, fingerprint: String) -> Result<Permissions, AuthError> {
        match self.identity.lookup(&fingerprint).await {
            Ok(owner) => Ok(Permissions {
                username: owner.username,
                repositories: owner.repositories.into_iter().collect(),
                fingerprint,
            }),
            Err(IdentityError::UnknownKey) => Err(AuthError::UnknownKey { fingerprint }),
            Err(source) => {
                tracing::warn!(%fingerprint, error = %source, "identity lookup failed");
                Err(AuthError::Lookup {
                    fingerprint,
                    source,
                })
            }
        }
    }
}
