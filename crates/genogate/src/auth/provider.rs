//! Identity providers consulted by the authenticator.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::AuthError;
use crate::config::schema::UserConfig;

/// External source of truth for user identities.
pub trait IdentityProvider: Send + Sync {
    fn verify_password(&self, username: &str, password: &SecretString) -> Result<bool, AuthError>;

    /// Returns the user the token was issued to, or `None` if the token is not valid.
    fn verify_token(&self, token: &SecretString) -> Result<Option<String>, AuthError>;
}

struct StaticUser {
    password: Option<SecretString>,
    token: Option<SecretString>,
}

/// Users declared in the config file.
pub struct StaticIdentityProvider {
    users: HashMap<String, StaticUser>,
}

impl StaticIdentityProvider {
    pub fn from_users(users: &[UserConfig]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    StaticUser {
                        password: u.password.clone().map(SecretString::from),
                        token: u.token.clone().map(SecretString::from),
                    },
                )
            })
            .collect();

        Self { users }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn verify_password(&self, username: &str, password: &SecretString) -> Result<bool, AuthError> {
        Ok(self
            .users
            .get(username)
            .and_then(|u| u.password.as_ref())
            .is_some_and(|expected| expected.expose_secret() == password.expose_secret()))
    }

    fn verify_token(&self, token: &SecretString) -> Result<Option<String>, AuthError> {
        let presented = token.expose_secret();
        Ok(self.users.iter().find_map(|(name, user)| {
            user.token
                .as_ref()
                .filter(|t| t.expose_secret() == presented)
                .map(|_| name.clone())
        }))
    }
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    user_name: String,
}

/// Validates credentials against an HTTP identity endpoint.
///
/// Tokens are sent as bearer auth, passwords as basic auth. A successful response carries a JSON
/// body with the `user_name` the credential belongs to; 401 and 403 mean the credential is invalid.
pub struct HttpIdentityProvider {
    client: Client,
    url: String,
}

impl HttpIdentityProvider {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn identity(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<Option<String>, AuthError> {
        let response = request
            .send()
            .map_err(|e| AuthError::Provider(format!("request to {} failed: {}", self.url, e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                let body = response.text().unwrap_or_default();
                return Err(AuthError::Provider(format!(
                    "identity check failed ({}): {}",
                    status, body
                )));
            }
            _ => {}
        }

        let identity: IdentityResponse = response
            .json()
            .map_err(|e| AuthError::Provider(format!("Failed to parse identity: {}", e)))?;

        Ok(Some(identity.user_name))
    }
}

impl IdentityProvider for HttpIdentityProvider {
    fn verify_password(&self, username: &str, password: &SecretString) -> Result<bool, AuthError> {
        let request = self
            .client
            .get(&self.url)
            .basic_auth(username, Some(password.expose_secret()));

        Ok(self
            .identity(request)?
            .is_some_and(|owner| owner == username))
    }

    fn verify_token(&self, token: &SecretString) -> Result<Option<String>, AuthError> {
        let request = self.client.get(&self.url).bearer_auth(token.expose_secret());
        self.identity(request)
    }
}
