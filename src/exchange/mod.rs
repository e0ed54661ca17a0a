pub mod google;
pub mod twitch;

use crate::config::ProvidersConfig;
use crate::retry::{is_transient, with_retry, CODE_EXCHANGE_BACKOFF};
use crate::store::{CredentialStore, CredentialUpdate};
use crate::types::Provider;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

pub use google::GoogleExchanger;
pub use twitch::TwitchExchanger;

/// Result of one token-endpoint call. `refresh_token` is absent when the
/// provider does not rotate it; the caller retains the original.
#[derive(Debug, Clone)]
pub struct TokenRefresh {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenRefresh {
    /// Absolute expiry, anchored to the moment of the successful response
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| now + chrono::Duration::seconds(secs as i64))
    }
}

/// Per-provider token endpoint adapter
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    fn provider(&self) -> Provider;

    /// Exchange a refresh token for a new access/refresh pair
    async fn refresh(&self, refresh_token: &str) -> Result<TokenRefresh>;

    /// Exchange a one-time authorization code for the initial pair
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenRefresh>;
}

/// The configured exchanger per provider, selected by enum
pub struct Exchangers {
    google: Arc<dyn TokenExchanger>,
    twitch: Arc<dyn TokenExchanger>,
}

impl Exchangers {
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        Ok(Self {
            google: Arc::new(GoogleExchanger::from_config(&config.google)?),
            twitch: Arc::new(TwitchExchanger::from_config(&config.twitch)?),
        })
    }

    pub fn new(google: Arc<dyn TokenExchanger>, twitch: Arc<dyn TokenExchanger>) -> Self {
        Self { google, twitch }
    }

    pub fn for_provider(&self, provider: Provider) -> &dyn TokenExchanger {
        match provider {
            Provider::Google => self.google.as_ref(),
            Provider::Twitch => self.twitch.as_ref(),
        }
    }
}

/// Interactive code exchange at login/link time.
///
/// Runs synchronously in a user-facing flow, so transient failures are
/// retried (3 attempts total, 1s/2s backoff) before giving up. A rejected
/// code is permanent and returns immediately. No partial credential is ever
/// stored: the upsert happens only after a successful exchange.
pub async fn link_account(
    store: &dyn CredentialStore,
    exchanger: &dyn TokenExchanger,
    user_id: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<()> {
    let grant = with_retry(3, CODE_EXCHANGE_BACKOFF, is_transient, || {
        exchanger.exchange_code(code, redirect_uri)
    })
    .await?;

    let expires_at = grant.expires_at(Utc::now());

    store
        .upsert(CredentialUpdate {
            user_id: user_id.to_string(),
            provider: exchanger.provider(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at,
        })
        .await?;

    info!(user_id, provider = %exchanger.provider(), "linked account");
    Ok(())
}
