//! OAuth access tokens and the persistence sink notified on renewal.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use super::credentials::Scope;
use crate::{Error, Result};

/// An OAuth access token with its refresh token and expiry.
///
/// A token is always replaced as a whole; its fields never change
/// independently.
#[derive(Clone)]
pub struct AuthToken {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
    expires_at: DateTime<Utc>,
    expires_in: Option<i64>,
}

impl AuthToken {
    /// Create a token.
    ///
    /// `refresh_token` is `None` for one-off tokens, which cannot be renewed.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: refresh_token.map(SecretString::from),
            expires_at,
            expires_in: None,
        }
    }

    /// Create a token from the unix `expires` timestamp the portal reports.
    pub fn from_timestamp(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires: i64,
    ) -> Result<Self> {
        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| Error::Validation(format!("Invalid token expiry timestamp: {}", expires)))?;
        Ok(Self::new(access_token, refresh_token, expires_at))
    }

    /// Record the token lifetime in seconds.
    pub fn with_expires_in(mut self, expires_in: i64) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// The access token.
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    /// The refresh token, `None` for one-off tokens.
    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.refresh_token.as_ref()
    }

    /// Whether the token can be renewed.
    pub fn is_renewable(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// When the access token expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Lifetime of the token in seconds, if known.
    pub fn expires_in(&self) -> Option<i64> {
        self.expires_in
    }

    /// Check if the access token has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the access token will expire within the given buffer.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        Utc::now()
            .checked_add_signed(buffer)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl PartialEq for AuthToken {
    fn eq(&self, other: &Self) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
            && self.refresh_token.as_ref().map(ExposeSecret::expose_secret)
                == other.refresh_token.as_ref().map(ExposeSecret::expose_secret)
            && self.expires_at == other.expires_at
            && self.expires_in == other.expires_in
    }
}

/// A token obtained from a refresh-token exchange, together with the portal
/// information the authorization server returns alongside it.
#[derive(Debug, Clone)]
pub struct RenewedAuthToken {
    /// The new token
    pub token: AuthToken,
    /// Portal identifier
    pub member_id: Option<String>,
    /// Domain of the server that issued the token
    pub domain: Option<String>,
    /// Portal REST endpoint
    pub client_endpoint: Option<String>,
    /// Authorization server REST endpoint
    pub server_endpoint: Option<String>,
    /// Application status on the portal (`F`, `D`, `T`, `P`, `L`, `S`)
    pub status: Option<String>,
    /// Granted scope
    pub scope: Option<Scope>,
}

/// Raw body of a successful refresh-token exchange.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub client_endpoint: Option<String>,
    #[serde(default)]
    pub server_endpoint: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Build the renewed token. A response without a new refresh token keeps
    /// the one that was just used.
    pub(crate) fn into_renewed(self, previous_refresh: &SecretString) -> Result<RenewedAuthToken> {
        let refresh_token = self
            .refresh_token
            .unwrap_or_else(|| previous_refresh.expose_secret().to_string());

        let mut token = match (self.expires, self.expires_in) {
            (Some(expires), _) => {
                AuthToken::from_timestamp(self.access_token, Some(refresh_token), expires)?
            }
            (None, Some(expires_in)) => {
                let expires_at = Duration::try_seconds(expires_in)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        Error::InvalidResponse(format!(
                            "Token lifetime out of range: {}",
                            expires_in
                        ))
                    })?;
                AuthToken::new(self.access_token, Some(refresh_token), expires_at)
            }
            (None, None) => {
                return Err(Error::InvalidResponse(
                    "Token response carries no expiry".to_string(),
                ))
            }
        };
        if let Some(expires_in) = self.expires_in {
            token = token.with_expires_in(expires_in);
        }

        // a scope that fails to parse never fails the renewal
        let scope = self.scope.and_then(|raw| match Scope::parse(&raw) {
            Ok(scope) => Some(scope),
            Err(err) => {
                warn!(scope = %raw, error = %err, "ignoring unparseable token scope");
                None
            }
        });

        Ok(RenewedAuthToken {
            token,
            member_id: self.member_id,
            domain: self.domain,
            client_endpoint: self.client_endpoint,
            server_endpoint: self.server_endpoint,
            status: self.status,
            scope,
        })
    }
}

/// Persistence sink for renewed tokens.
///
/// The renewal coordinator calls [`TokenSink::token_renewed`] once per
/// successful renewal, after the new token is already in use. Errors are
/// logged and do not fail the call that triggered the renewal.
///
/// # Example
///
/// ```
/// use bitrix24_rs::{RenewedAuthToken, Result, TokenSink};
///
/// struct LogSink;
///
/// #[async_trait::async_trait]
/// impl TokenSink for LogSink {
///     async fn token_renewed(&self, renewed: &RenewedAuthToken) -> Result<()> {
///         println!("token renewed for {:?}", renewed.member_id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Persist a renewed token.
    async fn token_renewed(&self, renewed: &RenewedAuthToken) -> Result<()>;
}
