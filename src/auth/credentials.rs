//! Credential value objects: incoming webhooks and OAuth applications.

use std::fmt;

use secrecy::SecretString;
use url::Url;

use super::token::AuthToken;
use crate::models::MethodName;
use crate::{Error, Result};

/// Default OAuth authorization server.
pub const DEFAULT_AUTH_SERVER: &str = "https://oauth.bitrix.info/";

/// Environment variable read by [`Credentials::webhook_from_env`].
pub const WEBHOOK_URL_ENV: &str = "BITRIX24_WEBHOOK_URL";

/// How the client authenticates against a portal.
///
/// Exactly one variant is active. Webhooks carry their secret in the URL;
/// OAuth credentials carry a renewable token together with the application
/// profile and endpoints needed to renew it.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Incoming webhook (`https://portal/rest/<user>/<secret>/`)
    Webhook(WebhookUrl),
    /// OAuth application installed on a portal
    OAuth {
        /// Current token
        token: AuthToken,
        /// Application identity used for renewal
        profile: ApplicationProfile,
        /// Portal and authorization server endpoints
        endpoints: Endpoints,
    },
}

impl Credentials {
    /// Credentials for an incoming webhook URL.
    ///
    /// # Example
    ///
    /// ```
    /// use bitrix24_rs::Credentials;
    ///
    /// let credentials = Credentials::webhook("https://example.bitrix24.com/rest/1/s3cr3t/").unwrap();
    /// assert!(credentials.is_webhook());
    /// ```
    pub fn webhook(url: &str) -> Result<Self> {
        Ok(Credentials::Webhook(WebhookUrl::new(url)?))
    }

    /// Credentials for an OAuth application.
    pub fn oauth(token: AuthToken, profile: ApplicationProfile, endpoints: Endpoints) -> Self {
        Credentials::OAuth {
            token,
            profile,
            endpoints,
        }
    }

    /// Read webhook credentials from `BITRIX24_WEBHOOK_URL`.
    pub fn webhook_from_env() -> Result<Self> {
        let url = std::env::var(WEBHOOK_URL_ENV)
            .map_err(|_| Error::Config(format!("{} is not set", WEBHOOK_URL_ENV)))?;
        Self::webhook(&url)
    }

    /// Returns `true` for webhook credentials.
    pub fn is_webhook(&self) -> bool {
        matches!(self, Credentials::Webhook(_))
    }

    /// Returns `true` for OAuth credentials.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Credentials::OAuth { .. })
    }
}

/// A validated incoming webhook URL.
///
/// The URL embeds the webhook secret, so `Debug` only shows the
/// host.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookUrl(Url);

impl WebhookUrl {
    /// Parse and validate a webhook URL.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self(parse_base_url(url, "webhook URL")?))
    }

    /// URL of `<method>.json` under this webhook.
    pub fn method_url(&self, method: &MethodName) -> Result<Url> {
        Ok(self.0.join(&format!("{}.json", method))?)
    }

    /// Portal host.
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }
}

impl fmt::Debug for WebhookUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WebhookUrl").field(&self.host()).finish()
    }
}

/// Identity of an OAuth application.
#[derive(Clone)]
pub struct ApplicationProfile {
    client_id: String,
    client_secret: SecretString,
    scope: Scope,
}

impl ApplicationProfile {
    /// Create an application profile.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Scope,
    ) -> Result<Self> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.trim().is_empty() {
            return Err(Error::Config("Application client id is empty".to_string()));
        }
        if client_secret.is_empty() {
            return Err(Error::Config("Application client secret is empty".to_string()));
        }
        Ok(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            scope,
        })
    }

    /// OAuth client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }

    /// Permission scope requested by the application.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl fmt::Debug for ApplicationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationProfile")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// A validated list of permission scope codes (`crm`, `task`, `user.brief`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scope(Vec<String>);

impl Scope {
    /// Validate scope codes. Duplicates are dropped, order is kept.
    pub fn new<I, S>(codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scope = Vec::new();
        for code in codes {
            let code = code.as_ref().trim().to_lowercase();
            let valid = !code.is_empty()
                && code
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.');
            if !valid {
                return Err(Error::Config(format!("Invalid scope code: {:?}", code)));
            }
            if !scope.contains(&code) {
                scope.push(code);
            }
        }
        Ok(Self(scope))
    }

    /// Parse a comma separated scope list as returned by the OAuth server.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::new(raw.split(',').map(str::trim).filter(|code| !code.is_empty()))
    }

    /// Scope codes.
    pub fn codes(&self) -> &[String] {
        &self.0
    }

    /// Whether the scope contains a code.
    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|c| c == code)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Portal REST endpoint and OAuth authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    client_endpoint: Url,
    auth_server: Url,
}

impl Endpoints {
    /// Create endpoints from a REST base URL (`https://portal/rest/`) and an
    /// authorization server URL.
    pub fn new(client_endpoint: &str, auth_server: &str) -> Result<Self> {
        Ok(Self {
            client_endpoint: parse_base_url(client_endpoint, "client endpoint")?,
            auth_server: parse_base_url(auth_server, "authorization server")?,
        })
    }

    /// Endpoints of a portal domain using the default authorization server.
    pub fn for_portal(domain: &str) -> Result<Self> {
        Self::new(&format!("https://{}/rest/", domain), DEFAULT_AUTH_SERVER)
    }

    /// REST base URL.
    pub fn client_endpoint(&self) -> &Url {
        &self.client_endpoint
    }

    /// Authorization server URL.
    pub fn auth_server(&self) -> &Url {
        &self.auth_server
    }

    /// URL of `<method>.json` on the portal.
    pub fn method_url(&self, method: &MethodName) -> Result<Url> {
        Ok(self.client_endpoint.join(&format!("{}.json", method))?)
    }

    /// URL of the refresh-token exchange.
    pub fn token_url(&self) -> Result<Url> {
        Ok(self.auth_server.join("oauth/token/")?)
    }
}

fn parse_base_url(raw: &str, what: &str) -> Result<Url> {
    let raw = raw.trim();
    let mut url = Url::parse(raw).map_err(|e| Error::Config(format!("Invalid {}: {}", what, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "Invalid {}: unsupported scheme {}",
            what,
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::Config(format!("Invalid {}: missing host", what)));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::Config(format!(
            "Invalid {}: query and fragment are not allowed",
            what
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_url() {
        let webhook = WebhookUrl::new("https://example.bitrix24.com/rest/1/abc123").unwrap();
        let method = MethodName::new("crm.deal.list").unwrap();
        assert_eq!(
            webhook.method_url(&method).unwrap().as_str(),
            "https://example.bitrix24.com/rest/1/abc123/crm.deal.list.json"
        );
    }

    #[test]
    fn test_webhook_debug_hides_secret() {
        let webhook = WebhookUrl::new("https://example.bitrix24.com/rest/1/abc123/").unwrap();
        let debug = format!("{:?}", webhook);
        assert!(!debug.contains("abc123"));
        assert!(debug.contains("example.bitrix24.com"));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(WebhookUrl::new("not a url").is_err());
        assert!(WebhookUrl::new("ftp://example.com/rest/1/x/").is_err());
        assert!(WebhookUrl::new("https://example.com/rest/1/x/?a=b").is_err());
        assert!(Endpoints::new("https://portal/rest/", "mailto:x@y").is_err());
    }

    #[test]
    fn test_endpoints() {
        let endpoints = Endpoints::for_portal("example.bitrix24.com").unwrap();
        assert_eq!(
            endpoints.client_endpoint().as_str(),
            "https://example.bitrix24.com/rest/"
        );
        assert_eq!(
            endpoints.token_url().unwrap().as_str(),
            "https://oauth.bitrix.info/oauth/token/"
        );
    }

    #[test]
    fn test_scope() {
        let scope = Scope::new(["crm", "Task", "crm", "user.brief"]).unwrap();
        assert_eq!(scope.codes(), ["crm", "task", "user.brief"]);
        assert!(scope.contains("task"));
        assert_eq!(scope.to_string(), "crm,task,user.brief");
        assert!(Scope::new(["crm;drop"]).is_err());
        assert_eq!(Scope::parse("crm, task,").unwrap().codes().len(), 2);
    }

    #[test]
    fn test_application_profile() {
        assert!(ApplicationProfile::new("", "secret", Scope::default()).is_err());
        assert!(ApplicationProfile::new("app.1", "", Scope::default()).is_err());
        let profile = ApplicationProfile::new("app.1", "s3cr3t-value", Scope::default()).unwrap();
        assert!(!format!("{:?}", profile).contains("s3cr3t-value"));
    }

    #[test]
    fn test_credentials_variants() {
        let credentials = Credentials::webhook("http://127.0.0.1:8080/rest/1/x/").unwrap();
        assert!(credentials.is_webhook());
        assert!(!credentials.is_oauth());
    }
}
