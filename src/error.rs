//! Error types for the Bitrix24 REST client.
//!
//! This module provides a single error type that covers every failure mode of
//! the request orchestration layer: transport failures, structured errors
//! reported by the portal, token renewal failures and commands rejected
//! before they ever reach the network.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// A specialized `Result` type for Bitrix24 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for all Bitrix24 API operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The physical HTTP call failed (connect, reset, timeout, TLS).
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The portal rejected the call with a structured error.
    #[error("Remote API error: code={code}, description={description}")]
    RemoteApi {
        /// HTTP status code, `None` for errors reported per batch command
        status: Option<u16>,
        /// Provider error code
        code: ApiErrorCode,
        /// Human-readable error description
        description: String,
        /// Raw error body for debugging
        body: Value,
    },

    /// The access token has expired.
    ///
    /// Consumed by the request core, which renews the token and replays the
    /// call. Callers only see it when a token is used outside of a call.
    #[error("Access token expired")]
    TokenExpired,

    /// Token renewal failed, or the portal rejected a freshly renewed token.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A command or batch was malformed and was not sent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A command inside a batch failed.
    #[error("Batch command {key} failed: {source}")]
    Command {
        /// Key of the failed command
        key: String,
        /// Error recorded for the command
        source: Arc<Error>,
    },

    /// The portal answered with a payload this client cannot interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid credentials or client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Returns `true` if this error is potentially transient and the
    /// operation could be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Error::RemoteApi { code, .. } => code.is_transient(),
            Error::Command { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if this is an authentication-related error.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::AuthenticationFailed(_) | Error::TokenExpired => true,
            Error::RemoteApi { code, .. } => code.is_auth_related(),
            _ => false,
        }
    }

    /// Returns `true` if this error indicates a client-side issue
    /// (invalid input, bad request, etc.).
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::RemoteApi {
                status: Some(status),
                ..
            } => (400..500).contains(status),
            Error::Validation(_) | Error::Config(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error indicates a server-side issue.
    pub fn is_server_error(&self) -> bool {
        match self {
            Error::RemoteApi {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the provider error code, if the portal reported one.
    pub fn api_code(&self) -> Option<&ApiErrorCode> {
        match self {
            Error::RemoteApi { code, .. } => Some(code),
            Error::Command { source, .. } => source.api_code(),
            _ => None,
        }
    }

    /// Build a remote error from an `{error, error_description}` body.
    pub(crate) fn from_api_response(status: Option<u16>, body: Value) -> Self {
        let (code, description) = parse_error_body(&body);
        Error::RemoteApi {
            status,
            code,
            description,
            body,
        }
    }
}

/// Extract the code and description from an error payload.
///
/// The portal reports errors either as an object
/// `{"error": "...", "error_description": "..."}` or, inside batch
/// responses, occasionally as a bare string.
pub(crate) fn parse_error_body(body: &Value) -> (ApiErrorCode, String) {
    match body {
        Value::String(code) => (ApiErrorCode::from_code(code), String::new()),
        _ => {
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .map(ApiErrorCode::from_code)
                .unwrap_or_else(|| ApiErrorCode::Other("UNKNOWN".to_string()));
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (code, description)
        }
    }
}

/// Error codes reported by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    /// `expired_token`: the OAuth access token has expired
    ExpiredToken,
    /// `invalid_token`: the OAuth access token is not recognised
    InvalidToken,
    /// `QUERY_LIMIT_EXCEEDED`: request rate limit reached
    QueryLimitExceeded,
    /// `OPERATION_TIME_LIMIT`: method execution time budget exhausted
    OperationTimeLimit,
    /// `ERROR_METHOD_NOT_FOUND`
    MethodNotFound,
    /// `ACCESS_DENIED`
    AccessDenied,
    /// `insufficient_scope`
    InsufficientScope,
    /// `PAYMENT_REQUIRED`: the portal plan does not include REST access
    PaymentRequired,
    /// `NO_AUTH_FOUND`
    NoAuthFound,
    /// `INVALID_CREDENTIALS`
    InvalidCredentials,
    /// `WRONG_AUTH_TYPE`
    WrongAuthType,
    /// `ERROR_BATCH_LENGTH_EXCEEDED`
    BatchLengthExceeded,
    /// `ERROR_BATCH_METHOD_NOT_ALLOWED`
    BatchMethodNotAllowed,
    /// `INVALID_REQUEST`
    InvalidRequest,
    /// `INTERNAL_SERVER_ERROR`
    InternalServerError,
    /// Any other code, kept verbatim
    Other(String),
}

impl ApiErrorCode {
    /// Classify a raw error code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "expired_token" => Self::ExpiredToken,
            "invalid_token" => Self::InvalidToken,
            "QUERY_LIMIT_EXCEEDED" => Self::QueryLimitExceeded,
            "OPERATION_TIME_LIMIT" => Self::OperationTimeLimit,
            "ERROR_METHOD_NOT_FOUND" => Self::MethodNotFound,
            "ACCESS_DENIED" => Self::AccessDenied,
            "insufficient_scope" => Self::InsufficientScope,
            "PAYMENT_REQUIRED" => Self::PaymentRequired,
            "NO_AUTH_FOUND" => Self::NoAuthFound,
            "INVALID_CREDENTIALS" => Self::InvalidCredentials,
            "WRONG_AUTH_TYPE" => Self::WrongAuthType,
            "ERROR_BATCH_LENGTH_EXCEEDED" => Self::BatchLengthExceeded,
            "ERROR_BATCH_METHOD_NOT_ALLOWED" => Self::BatchMethodNotAllowed,
            "INVALID_REQUEST" => Self::InvalidRequest,
            "INTERNAL_SERVER_ERROR" => Self::InternalServerError,
            other => Self::Other(other.to_string()),
        }
    }

    /// The code as the portal spells it.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ExpiredToken => "expired_token",
            Self::InvalidToken => "invalid_token",
            Self::QueryLimitExceeded => "QUERY_LIMIT_EXCEEDED",
            Self::OperationTimeLimit => "OPERATION_TIME_LIMIT",
            Self::MethodNotFound => "ERROR_METHOD_NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InsufficientScope => "insufficient_scope",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::NoAuthFound => "NO_AUTH_FOUND",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::WrongAuthType => "WRONG_AUTH_TYPE",
            Self::BatchLengthExceeded => "ERROR_BATCH_LENGTH_EXCEEDED",
            Self::BatchMethodNotAllowed => "ERROR_BATCH_METHOD_NOT_ALLOWED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::Other(code) => code,
        }
    }

    /// Returns `true` for codes that signal an expired or unusable access
    /// token which a refresh-token exchange can fix.
    pub fn is_token_expiry(&self) -> bool {
        matches!(self, Self::ExpiredToken | Self::InvalidToken)
    }

    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueryLimitExceeded | Self::OperationTimeLimit | Self::InternalServerError
        )
    }

    fn is_auth_related(&self) -> bool {
        matches!(
            self,
            Self::ExpiredToken
                | Self::InvalidToken
                | Self::NoAuthFound
                | Self::InvalidCredentials
                | Self::WrongAuthType
                | Self::InsufficientScope
        )
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
