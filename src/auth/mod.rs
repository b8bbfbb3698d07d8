//! Authentication: credentials and access token renewal.
//!
//! Two authentication methods are supported:
//!
//! 1. **Incoming webhook** - the secret is part of the URL, nothing expires
//! 2. **OAuth application** - a short-lived access token renewed with a
//!    refresh token when the portal reports it as expired
//!
//! # Webhook
//!
//! ```
//! use bitrix24_rs::Credentials;
//!
//! let credentials = Credentials::webhook("https://example.bitrix24.com/rest/1/s3cr3t/")?;
//! # Ok::<(), bitrix24_rs::Error>(())
//! ```
//!
//! # OAuth
//!
//! ```
//! use bitrix24_rs::auth::{ApplicationProfile, AuthToken, Credentials, Endpoints, Scope};
//!
//! let token = AuthToken::from_timestamp("access", Some("refresh".into()), 1_900_000_000)?;
//! let profile = ApplicationProfile::new("app.123", "secret", Scope::new(["crm"])?)?;
//! let endpoints = Endpoints::for_portal("example.bitrix24.com")?;
//! let credentials = Credentials::oauth(token, profile, endpoints);
//! # Ok::<(), bitrix24_rs::Error>(())
//! ```

mod credentials;
mod renewal;
mod token;

pub use credentials::{
    ApplicationProfile, Credentials, Endpoints, Scope, WebhookUrl, DEFAULT_AUTH_SERVER,
    WEBHOOK_URL_ENV,
};
pub use renewal::{RenewalCoordinator, RenewalState};
pub(crate) use renewal::TokenLease;
pub use token::{AuthToken, RenewedAuthToken, TokenSink};
