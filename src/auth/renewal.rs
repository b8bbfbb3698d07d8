//! Access token renewal for OAuth credentials.
//!
//! The [`RenewalCoordinator`] is the only writer of the token slot. It
//! tracks a [`RenewalState`] and guarantees that concurrent callers which
//! observe the same expired token share a single refresh-token exchange.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::credentials::{ApplicationProfile, Endpoints};
use super::token::{AuthToken, RenewedAuthToken, TokenResponse, TokenSink};
use crate::{Error, Result};

/// Lifecycle of the access token owned by a [`RenewalCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// The current token is believed to be valid.
    Valid,
    /// The portal reported the current token as expired.
    Expired,
    /// A refresh-token exchange is in flight.
    Renewing,
    /// The last refresh-token exchange was rejected.
    Failed,
}

impl RenewalState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RenewalState::Valid,
            1 => RenewalState::Expired,
            2 => RenewalState::Renewing,
            _ => RenewalState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RenewalState::Valid => 0,
            RenewalState::Expired => 1,
            RenewalState::Renewing => 2,
            RenewalState::Failed => 3,
        }
    }
}

/// Token plus the generation it was installed at.
struct TokenSlot {
    token: AuthToken,
    generation: u64,
}

/// Snapshot of the token taken before a physical call.
///
/// `generation` identifies the token; `exchanges` counts the refresh
/// exchanges finished at snapshot time, so a caller can tell whether an
/// exchange for its token already ran (and failed) while it waited.
#[derive(Debug, Clone)]
pub(crate) struct TokenLease {
    pub(crate) token: AuthToken,
    pub(crate) generation: u64,
    pub(crate) exchanges: u64,
}

/// Serializes and performs refresh-token exchanges for one set of OAuth
/// credentials.
pub struct RenewalCoordinator {
    http: reqwest::Client,
    profile: ApplicationProfile,
    endpoints: Endpoints,
    slot: RwLock<TokenSlot>,
    renewal: Mutex<()>,
    exchanges: AtomicU64,
    state: AtomicU8,
    sink: Option<Arc<dyn TokenSink>>,
}

impl RenewalCoordinator {
    pub(crate) fn new(
        http: reqwest::Client,
        token: AuthToken,
        profile: ApplicationProfile,
        endpoints: Endpoints,
        sink: Option<Arc<dyn TokenSink>>,
    ) -> Self {
        Self {
            http,
            profile,
            endpoints,
            slot: RwLock::new(TokenSlot {
                token,
                generation: 0,
            }),
            renewal: Mutex::new(()),
            exchanges: AtomicU64::new(0),
            state: AtomicU8::new(RenewalState::Valid.as_u8()),
            sink,
        }
    }

    /// Current renewal state.
    pub fn state(&self) -> RenewalState {
        RenewalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The current token. Never a mix of pre- and post-renewal fields.
    pub async fn current_token(&self) -> AuthToken {
        self.slot.read().await.token.clone()
    }

    /// Portal and authorization server endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Application identity used for renewal.
    pub fn profile(&self) -> &ApplicationProfile {
        &self.profile
    }

    pub(crate) async fn lease(&self) -> TokenLease {
        let slot = self.slot.read().await;
        TokenLease {
            token: slot.token.clone(),
            generation: slot.generation,
            exchanges: self.exchanges.load(Ordering::SeqCst),
        }
    }

    /// Whether the leased token expires within `buffer`.
    pub(crate) fn needs_early_renewal(lease: &TokenLease, buffer: Duration) -> bool {
        lease.token.is_renewable() && lease.token.expires_within(buffer)
    }

    /// Replace the token leased in `lease`.
    ///
    /// Returns immediately if a concurrent caller already installed a newer
    /// token. If an exchange for the same token finished and failed while
    /// this caller waited, its failure is shared instead of exchanging again.
    pub(crate) async fn renew(&self, lease: &TokenLease) -> Result<()> {
        let _permit = self.renewal.lock().await;

        let (refresh_token, generation) = {
            let slot = self.slot.read().await;
            if slot.generation != lease.generation {
                debug!(
                    generation = slot.generation,
                    "access token already renewed by a concurrent call"
                );
                return Ok(());
            }
            (slot.token.refresh_token().cloned(), slot.generation)
        };

        if self.exchanges.load(Ordering::SeqCst) != lease.exchanges {
            return Err(Error::AuthenticationFailed(
                "access token renewal failed in a concurrent call".to_string(),
            ));
        }

        self.set_state(RenewalState::Expired);

        let Some(refresh_token) = refresh_token else {
            self.set_state(RenewalState::Failed);
            warn!("access token expired and cannot be renewed without a refresh token");
            return Err(Error::AuthenticationFailed(
                "access token expired and no refresh token is available".to_string(),
            ));
        };

        let guard = RenewingGuard::begin(&self.state);
        debug!(generation, "renewing access token");
        let outcome = self.exchange(&refresh_token).await;
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(renewed) => {
                {
                    let mut slot = self.slot.write().await;
                    slot.token = renewed.token.clone();
                    slot.generation += 1;
                }
                guard.finish(RenewalState::Valid);
                info!(
                    generation = generation + 1,
                    expires_at = %renewed.token.expires_at(),
                    "access token renewed"
                );
                self.notify_sink(&renewed).await;
                Ok(())
            }
            Err(err) => {
                guard.finish(RenewalState::Failed);
                warn!(error = %err, "access token renewal failed");
                Err(match err {
                    Error::AuthenticationFailed(message) => Error::AuthenticationFailed(message),
                    other => Error::AuthenticationFailed(format!(
                        "refresh token exchange failed: {}",
                        other
                    )),
                })
            }
        }
    }

    async fn exchange(&self, refresh_token: &SecretString) -> Result<RenewedAuthToken> {
        let url = self.endpoints.token_url()?;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.profile.client_id()),
            ("client_secret", self.profile.client_secret().expose_secret()),
            ("refresh_token", refresh_token.expose_secret()),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if !status.is_success() || body.get("error").is_some() {
            let (code, description) = crate::error::parse_error_body(&body);
            return Err(Error::AuthenticationFailed(format!(
                "token exchange rejected ({}): {} {}",
                status.as_u16(),
                code,
                description
            )));
        }

        let token_response: TokenResponse = serde_json::from_value(body)?;
        token_response.into_renewed(refresh_token)
    }

    async fn notify_sink(&self, renewed: &RenewedAuthToken) {
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.token_renewed(renewed).await {
                warn!(error = %err, "failed to persist renewed access token");
            }
        }
    }

    fn set_state(&self, state: RenewalState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RenewalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalCoordinator")
            .field("profile", &self.profile)
            .field("endpoints", &self.endpoints)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the state `Renewing` for the duration of an exchange.
///
/// If the exchange future is dropped before it finishes, the state falls
/// back to `Expired` and the next caller performs the renewal.
struct RenewingGuard<'a> {
    state: &'a AtomicU8,
    finished: bool,
}

impl<'a> RenewingGuard<'a> {
    fn begin(state: &'a AtomicU8) -> Self {
        state.store(RenewalState::Renewing.as_u8(), Ordering::SeqCst);
        Self {
            state,
            finished: false,
        }
    }

    fn finish(mut self, outcome: RenewalState) {
        self.state.store(outcome.as_u8(), Ordering::SeqCst);
        self.finished = true;
    }
}

impl Drop for RenewingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state
                .store(RenewalState::Expired.as_u8(), Ordering::SeqCst);
        }
    }
}
