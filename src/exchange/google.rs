/// Google OAuth token endpoint adapter.
///
/// Google does not rotate refresh tokens: a refresh response usually omits
/// `refresh_token`, and the stored original must be retained by the caller.
use crate::config::OAuthClientConfig;
use crate::types::Provider;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{TokenExchanger, TokenRefresh};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct GoogleExchanger {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
}

impl GoogleExchanger {
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
            anyhow::bail!("Google token endpoint rejected request: {} {}", status, error_text);
        }

        let token: GoogleTokenResponse = res.json().await?;

        Ok(TokenRefresh {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl TokenExchanger for GoogleExchanger {
    fn provider(&self) -> Provider {
        Provider::Google
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
