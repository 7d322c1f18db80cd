//! Token verification against the external identity service.
//!
//! Any answer other than an explicit "verified" (HTTP error, malformed body,
//! unreachable service) counts as a failed login. It is never fatal to the
//! router.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use parley_shared::{ChatError, Username};

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve an opaque session token to a username.
    async fn verify(&self, token: &str) -> Result<Username, ChatError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Body returned by the identity service. Older deployments answer with
/// `success` instead of `verified`.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default, alias = "success")]
    verified: bool,
    #[serde(default)]
    username: Option<String>,
}

/// Calls `GET <url>` with the token in the `Authorization` header.
#[derive(Clone)]
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityVerifier {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Username, ChatError> {
        if token.is_empty() {
            return Err(ChatError::AuthFailed);
        }

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %self.url, "Identity service unreachable");
                ChatError::AuthFailed
            })?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Token rejected by identity service");
            return Err(ChatError::AuthFailed);
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "Malformed identity service response");
            ChatError::AuthFailed
        })?;

        match body.username {
            Some(name) if body.verified && !name.is_empty() => Ok(Username::new(name)),
            _ => Err(ChatError::AuthFailed),
        }
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Fixed token table, for local development without an identity service.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, Username>,
}

impl StaticIdentityVerifier {
    pub fn new<I, T, U>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<Username>,
    {
        Self {
            tokens: entries
                .into_iter()
                .map(|(token, user)| (token.into(), user.into()))
                .collect(),
        }
    }

    /// Parse `token=user,token=user`. Malformed pairs are skipped.
    pub fn from_csv(list: &str) -> Self {
        let entries = list.split(',').filter_map(|pair| {
            let (token, user) = pair.split_once('=')?;
            let (token, user) = (token.trim(), user.trim());
            (!token.is_empty() && !user.is_empty()).then(|| (token.to_string(), user.to_string()))
        });
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Username, ChatError> {
        self.tokens.get(token).cloned().ok_or(ChatError::AuthFailed)
    }
}
