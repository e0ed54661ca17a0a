/// Twitch OAuth token endpoint adapter.
///
/// Twitch rotates the refresh token on every use: each refresh response
/// carries a new one that must replace the stored value.
use crate::config::OAuthClientConfig;
use crate::types::Provider;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{TokenExchanger, TokenRefresh};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct TwitchExchanger {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
}

impl TwitchExchanger {
    pub fn from_config(config: &OAuthClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url: config
                .token_url
                .clone()
                .unwrap_or_else(|| TOKEN_URL.to_string()),
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenRefresh> {
        let res = self
            .client
            .post(&self.token_url)
            .form(params)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            anyhow::bail!("Twitch token endpoint rejected request: {} {}", status, error_text);
        }

        let token: TwitchTokenResponse = res.json().await?;

        Ok(TokenRefresh {
            access_token: token.access_token,
            refresh_token: Some(token.refresh_token),
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl TokenExchanger for TwitchExchanger {
    fn provider(&self) -> Provider {
        Provider::Twitch
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenRefresh> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenRefresh> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }
}
