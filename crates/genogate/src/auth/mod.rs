//! Per-call credential checks.
//!
//! Every RPC carries a [`Credential`]; the [`Authenticator`] turns it into a [`Principal`] or an
//! [`AuthError`]. Token validations are cached for a bounded time so the identity provider is not
//! hit on every call.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod provider;

pub use provider::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};

use crate::config::schema::{AuthConfig, ProviderConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("username must not be empty")]
    MissingUsername,

    #[error("exactly one of password or token must be supplied")]
    InvalidSecretCount,

    #[error("invalid credentials for user '{0}'")]
    Rejected(String),

    #[error("token was issued to '{actual}', not '{expected}'")]
    TokenUserMismatch { expected: String, actual: String },

    #[error("identity provider does not support {0} authentication")]
    Unsupported(&'static str),

    #[error("identity provider unavailable: {0}")]
    Provider(String),
}

/// Caller identity as presented on the wire. Never persisted.
#[derive(Debug)]
pub struct Credential {
    pub username: String,
    pub password: Option<SecretString>,
    pub token: Option<SecretString>,
}

impl Credential {
    pub fn with_password(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Some(SecretString::from(password.to_string())),
            token: None,
        }
    }

    pub fn with_token(username: &str, token: &str) -> Self {
        Self {
            username: username.to_string(),
            password: None,
            token: Some(SecretString::from(token.to_string())),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
}

impl Principal {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
        }
    }
}

enum Secret<'a> {
    Password(&'a SecretString),
    Token(&'a SecretString),
}

fn non_empty(secret: &Option<SecretString>) -> Option<&SecretString> {
    secret
        .as_ref()
        .filter(|s| !s.expose_secret().is_empty())
}

pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    /// token -> username the provider vouched for
    token_cache: Cache<String, String>,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn IdentityProvider>, token_ttl: Duration) -> Self {
        let token_cache = Cache::builder()
            .time_to_live(token_ttl)
            .max_capacity(10_000)
            .build();

        Self {
            provider,
            token_cache,
        }
    }

    /// Builds the authenticator described by the `auth` config section.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let provider: Arc<dyn IdentityProvider> = match &config.provider {
            ProviderConfig::Static { users } => Arc::new(StaticIdentityProvider::from_users(users)),
            ProviderConfig::Http { url, timeout_secs } => Arc::new(HttpIdentityProvider::new(
                url,
                Duration::from_secs(*timeout_secs),
            )?),
        };

        Ok(Self::new(
            provider,
            Duration::from_secs(config.token_cache_ttl_secs),
        ))
    }

    pub fn authenticate(&self, credential: &Credential) -> Result<Principal, AuthError> {
        let username = credential.username.trim();
        if username.is_empty() {
            return Err(AuthError::MissingUsername);
        }

        let secret = match (
            non_empty(&credential.password),
            non_empty(&credential.token),
        ) {
            (Some(password), None) => Secret::Password(password),
            (None, Some(token)) => Secret::Token(token),
            _ => return Err(AuthError::InvalidSecretCount),
        };

        match secret {
            Secret::Password(password) => {
                if self.provider.verify_password(username, password)? {
                    Ok(Principal::new(username))
                } else {
                    log::warn!("Password rejected for user {}", username);
                    Err(AuthError::Rejected(username.to_string()))
                }
            }
            Secret::Token(token) => {
                let owner = self.token_owner(token)?;
                if owner != username {
                    log::warn!(
                        "Token presented by {} belongs to {}",
                        username,
                        owner
                    );
                    return Err(AuthError::TokenUserMismatch {
                        expected: username.to_string(),
                        actual: owner,
                    });
                }
                Ok(Principal::new(username))
            }
        }
    }

    fn token_owner(&self, token: &SecretString) -> Result<String, AuthError> {
        let key = token.expose_secret().to_string();
        if let Some(owner) = self.token_cache.get(&key) {
            return Ok(owner);
        }

        match self.provider.verify_token(token)? {
            Some(owner) => {
                self.token_cache.insert(key, owner.clone());
                Ok(owner)
            }
            None => Err(AuthError::Rejected("<token>".to_string())),
        }
    }
}
