//! HTTP client implementation and the request core every call goes through.

use std::sync::Arc;
use std::time::Instant;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{
    AuthToken, Credentials, RenewalCoordinator, RenewalState, TokenLease, TokenSink, WebhookUrl,
};
use crate::error::ApiErrorCode;
use crate::models::{MethodName, ResponseData};
use crate::{Error, Result};

use super::batch::BatchService;
use super::config::ClientConfig;
use super::paginated::ItemsReader;

/// The main client for interacting with a Bitrix24 portal.
///
/// The client is cheap to clone; clones share the HTTP connection pool and
/// the credentials, including any renewed OAuth token.
///
/// # Example
///
/// ```no_run
/// use bitrix24_rs::{Bitrix24Client, Credentials};
/// use serde_json::json;
///
/// # async fn example() -> bitrix24_rs::Result<()> {
/// let client = Bitrix24Client::new(Credentials::webhook(
///     "https://example.bitrix24.com/rest/1/s3cr3t/",
/// )?)?;
///
/// let deal = client.call("crm.deal.get", json!({"id": 42})).await?;
/// println!("{}", deal.result);
/// # Ok(())
/// # }
/// ```
pub struct Bitrix24Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) http: reqwest::Client,
    pub(crate) auth: Authenticator,
    pub(crate) config: ClientConfig,
}

/// Runtime form of [`Credentials`].
pub(crate) enum Authenticator {
    Webhook(WebhookUrl),
    OAuth(Arc<RenewalCoordinator>),
}

/// Result of one physical attempt, inspected before deciding to replay.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    /// The portal accepted the call.
    Ok(ResponseData),
    /// The portal rejected the OAuth access token as expired.
    RetryableAuthExpiry,
    /// Any other failure.
    Fatal(Error),
}

/// Call parameters plus the OAuth `auth` field.
#[derive(Serialize)]
struct RequestBody<'a, P: Serialize + ?Sized> {
    #[serde(flatten)]
    params: &'a P,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a str>,
}

impl Bitrix24Client {
    /// Create a client with default configuration.
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::build(credentials, ClientConfig::default(), None)
    }

    /// Create a client with custom configuration.
    pub fn with_config(credentials: Credentials, config: ClientConfig) -> Result<Self> {
        Self::build(credentials, config, None)
    }

    /// Create a client that reports renewed OAuth tokens to `sink`.
    pub fn with_token_sink(
        credentials: Credentials,
        config: ClientConfig,
        sink: Arc<dyn TokenSink>,
    ) -> Result<Self> {
        Self::build(credentials, config, Some(sink))
    }

    fn build(
        credentials: Credentials,
        config: ClientConfig,
        sink: Option<Arc<dyn TokenSink>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        let auth = match credentials {
            Credentials::Webhook(webhook) => Authenticator::Webhook(webhook),
            Credentials::OAuth {
                token,
                profile,
                endpoints,
            } => Authenticator::OAuth(Arc::new(RenewalCoordinator::new(
                http.clone(),
                token,
                profile,
                endpoints,
                sink,
            ))),
        };

        Ok(Self {
            inner: Arc::new(ClientInner { http, auth, config }),
        })
    }

    /// Call a REST method.
    ///
    /// `params` must be a JSON object or `null`. An expired OAuth token is
    /// renewed and the call replayed once, transparently.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an invalid method name or params
    /// - [`Error::RemoteApi`] when the portal rejects the call
    /// - [`Error::Transport`] when the HTTP call fails
    /// - [`Error::AuthenticationFailed`] when the token cannot be renewed, or
    ///   is rejected again after renewal
    pub async fn call(&self, method: &str, params: Value) -> Result<ResponseData> {
        let method = MethodName::new(method)?;
        if !matches!(params, Value::Object(_) | Value::Null) {
            return Err(Error::Validation(format!(
                "Params of {} must be an object",
                method
            )));
        }
        self.inner.call_method(&method, &params).await
    }

    /// Call a REST method and deserialize its `result`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call(method, params).await?.into_result()
    }

    /// Get the batch service.
    pub fn batch(&self) -> BatchService {
        BatchService::new(self.inner.clone())
    }

    /// Read all items of a list method lazily.
    ///
    /// See [`ItemsReader`] for strategies and options.
    pub fn items(&self, method: impl Into<String>) -> ItemsReader {
        ItemsReader::new(self.inner.clone(), method.into())
    }

    /// Renew the OAuth access token now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for webhook credentials and
    /// [`Error::AuthenticationFailed`] if the exchange is rejected.
    pub async fn renew_token(&self) -> Result<()> {
        match &self.inner.auth {
            Authenticator::Webhook(_) => Err(Error::Config(
                "Webhook credentials have no token to renew".to_string(),
            )),
            Authenticator::OAuth(coordinator) => {
                let lease = coordinator.lease().await;
                coordinator.renew(&lease).await
            }
        }
    }

    /// The current OAuth token, `None` for webhook credentials.
    pub async fn current_token(&self) -> Option<AuthToken> {
        match &self.inner.auth {
            Authenticator::Webhook(_) => None,
            Authenticator::OAuth(coordinator) => Some(coordinator.current_token().await),
        }
    }

    /// State of the token renewal, `None` for webhook credentials.
    pub fn renewal_state(&self) -> Option<RenewalState> {
        match &self.inner.auth {
            Authenticator::Webhook(_) => None,
            Authenticator::OAuth(coordinator) => Some(coordinator.state()),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl ClientInner {
    /// Call a validated method with a JSON params object.
    pub(crate) async fn call_method(
        &self,
        method: &MethodName,
        params: &Value,
    ) -> Result<ResponseData> {
        self.call_raw(method, params).await
    }

    /// The single chokepoint for physical calls.
    pub(crate) async fn call_raw<P>(&self, method: &MethodName, params: &P) -> Result<ResponseData>
    where
        P: Serialize + ?Sized + Sync,
    {
        let started = Instant::now();
        debug!(method = %method, "call started");

        let result = match &self.auth {
            Authenticator::Webhook(webhook) => self.call_webhook(webhook, method, params).await,
            Authenticator::OAuth(coordinator) => self.call_oauth(coordinator, method, params).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(method = %method, elapsed_ms, "call finished"),
            Err(err) => debug!(method = %method, elapsed_ms, error = %err, "call finished"),
        }
        result
    }

    async fn call_webhook<P>(
        &self,
        webhook: &WebhookUrl,
        method: &MethodName,
        params: &P,
    ) -> Result<ResponseData>
    where
        P: Serialize + ?Sized + Sync,
    {
        let url = webhook.method_url(method)?;
        let body = RequestBody { params, auth: None };
        match self.dispatch(method, &url, &body, false).await {
            CallOutcome::Ok(response) => Ok(response),
            CallOutcome::RetryableAuthExpiry => Err(Error::TokenExpired),
            CallOutcome::Fatal(err) => Err(err),
        }
    }

    /// Call with an OAuth token: on expiry renew once and replay once.
    async fn call_oauth<P>(
        &self,
        coordinator: &RenewalCoordinator,
        method: &MethodName,
        params: &P,
    ) -> Result<ResponseData>
    where
        P: Serialize + ?Sized + Sync,
    {
        let url = coordinator.endpoints().method_url(method)?;
        let mut lease = coordinator.lease().await;

        if let Some(buffer) = self.config.refresh_ahead {
            if RenewalCoordinator::needs_early_renewal(&lease, buffer) {
                debug!(method = %method, "renewing access token ahead of expiry");
                coordinator.renew(&lease).await?;
                lease = coordinator.lease().await;
            }
        }

        let mut renewed = false;
        loop {
            match self.dispatch_with_token(method, &url, params, &lease).await {
                CallOutcome::Ok(response) => return Ok(response),
                CallOutcome::Fatal(err) => return Err(err),
                CallOutcome::RetryableAuthExpiry if renewed => {
                    warn!(method = %method, "access token rejected again after renewal");
                    return Err(Error::AuthenticationFailed(
                        "access token rejected again after renewal".to_string(),
                    ));
                }
                CallOutcome::RetryableAuthExpiry => {
                    debug!(method = %method, generation = lease.generation, "access token expired");
                    coordinator.renew(&lease).await?;
                    renewed = true;
                    lease = coordinator.lease().await;
                }
            }
        }
    }

    async fn dispatch_with_token<P>(
        &self,
        method: &MethodName,
        url: &Url,
        params: &P,
        lease: &TokenLease,
    ) -> CallOutcome
    where
        P: Serialize + ?Sized + Sync,
    {
        let token: &SecretString = lease.token.access_token();
        let body = RequestBody {
            params,
            auth: Some(token.expose_secret()),
        };
        self.dispatch(method, url, &body, true).await
    }

    /// Send one call, retrying transient failures per the retry policy.
    async fn dispatch<B>(&self, method: &MethodName, url: &Url, body: &B, oauth: bool) -> CallOutcome
    where
        B: Serialize + ?Sized + Sync,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.send_once(url, body, oauth).await {
                CallOutcome::Fatal(err) if attempt < retry.max_retries && retry.should_retry(&err) => {
                    let backoff = retry.backoff_for_attempt(attempt);
                    warn!(
                        method = %method,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn send_once<B>(&self, url: &Url, body: &B, oauth: bool) -> CallOutcome
    where
        B: Serialize + ?Sized + Sync,
    {
        let response = match self.http.post(url.clone()).json(body).send().await {
            Ok(response) => response,
            Err(err) => return CallOutcome::Fatal(err.into()),
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return CallOutcome::Fatal(err.into()),
        };

        classify(status, &bytes, oauth)
    }
}

/// Turn a raw HTTP response into a call outcome.
pub(crate) fn classify(status: StatusCode, bytes: &[u8], oauth: bool) -> CallOutcome {
    let body: Value = match serde_json::from_slice(bytes) {
        Ok(body) => body,
        Err(_) if status.is_success() => {
            return CallOutcome::Fatal(Error::InvalidResponse(format!(
                "response body is not JSON ({} bytes)",
                bytes.len()
            )))
        }
        Err(_) => Value::Null,
    };

    if body.get("error").is_none() {
        if status.is_success() {
            return match serde_json::from_value::<ResponseData>(body) {
                Ok(response) => CallOutcome::Ok(response),
                Err(err) => CallOutcome::Fatal(Error::InvalidResponse(err.to_string())),
            };
        }
        return CallOutcome::Fatal(Error::RemoteApi {
            status: Some(status.as_u16()),
            code: ApiErrorCode::Other(format!("HTTP_{}", status.as_u16())),
            description: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        });
    }

    let err = Error::from_api_response(Some(status.as_u16()), body);
    if oauth && err.api_code().is_some_and(ApiErrorCode::is_token_expiry) {
        return CallOutcome::RetryableAuthExpiry;
    }
    CallOutcome::Fatal(err)
}

impl Clone for Bitrix24Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Bitrix24Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match &self.inner.auth {
            Authenticator::Webhook(webhook) => format!("{:?}", webhook),
            Authenticator::OAuth(coordinator) => format!("{:?}", coordinator),
        };
        f.debug_struct("Bitrix24Client")
            .field("auth", &auth)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_classify_success() {
        let outcome = classify(
            StatusCode::OK,
            &body(json!({"result": [1, 2], "total": 2})),
            true,
        );
        match outcome {
            CallOutcome::Ok(response) => {
                assert_eq!(response.result, json!([1, 2]));
                assert_eq!(response.total, Some(2));
            }
            other => panic!("Expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_expired_token() {
        let expired = body(json!({
            "error": "expired_token",
            "error_description": "The access token provided has expired."
        }));

        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, &expired, true),
            CallOutcome::RetryableAuthExpiry
        ));
        // webhooks have no token to renew
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, &expired, false),
            CallOutcome::Fatal(Error::RemoteApi { .. })
        ));
    }

    #[test]
    fn test_classify_remote_error() {
        let outcome = classify(
            StatusCode::BAD_REQUEST,
            &body(json!({"error": "ERROR_METHOD_NOT_FOUND", "error_description": "Method not found!"})),
            true,
        );
        match outcome {
            CallOutcome::Fatal(Error::RemoteApi { status, code, .. }) => {
                assert_eq!(status, Some(400));
                assert_eq!(code, ApiErrorCode::MethodNotFound);
            }
            other => panic!("Expected RemoteApi, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_non_json() {
        assert!(matches!(
            classify(StatusCode::OK, b"<html>", false),
            CallOutcome::Fatal(Error::InvalidResponse(_))
        ));
        match classify(StatusCode::BAD_GATEWAY, b"<html>", false) {
            CallOutcome::Fatal(Error::RemoteApi { status, code, .. }) => {
                assert_eq!(status, Some(502));
                assert_eq!(code, ApiErrorCode::Other("HTTP_502".into()));
            }
            other => panic!("Expected RemoteApi, got {:?}", other),
        }
    }

    #[test]
    fn test_request_body_flattens_params() {
        let params = json!({"id": 1});
        let with_auth = serde_json::to_value(RequestBody {
            params: &params,
            auth: Some("token"),
        })
        .unwrap();
        assert_eq!(with_auth, json!({"id": 1, "auth": "token"}));

        let without_auth = serde_json::to_value(RequestBody {
            params: &Value::Null,
            auth: None,
        })
        .unwrap();
        assert_eq!(without_auth, json!({}));
    }

    #[tokio::test]
    async fn test_call_rejects_array_params() {
        let client =
            Bitrix24Client::new(Credentials::webhook("http://127.0.0.1:9/rest/1/x/").unwrap())
                .unwrap();
        let err = client.call("crm.deal.list", json!([1])).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(client.current_token().await.is_none());
        assert!(client.renewal_state().is_none());
        assert!(matches!(client.renew_token().await, Err(Error::Config(_))));
    }
}
