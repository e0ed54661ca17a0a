/// Twitch Helix relationship checks.
use crate::config::OAuthClientConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{classify_response, TwitchRelationships, VerifyError};

const API_BASE: &str = "https://api.twitch.tv/helix";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct DataResponse<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct UserItem {
    id: String,
}

#[derive(Deserialize)]
struct FollowItem {
    #[allow(dead_code)]
    broadcaster_id: String,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    #[allow(dead_code)]
    tier: String,
}

pub struct TwitchVerifier {
    client: reqwest::Client,
    client_id: String,
    api_base: String,
}

impl TwitchVerifier {
    pub fn from_config(config: &OAuthClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| API_BASE.to_string()),
        })
    }

    /// Helix scopes relationship queries by numeric user id, not by token,
    /// so resolve the token's owner first.
    async fn own_user_id(&self, access_token: &str) -> Result<String, VerifyError> {
        let res = self
            .client
            .get(format!("{}/users", self.api_base))
            .bearer_auth(access_token)
            .header("Client-Id", &self.client_id)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let users: DataResponse<UserItem> = res
            .json()
            .await
            .map_err(|e| VerifyError::Provider(format!("malformed users response: {}", e)))?;

        users
            .data
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| VerifyError::Provider("token resolved to no user".to_string()))
    }
}

#[async_trait]
impl TwitchRelationships for TwitchVerifier {
    async fn follows(&self, access_token: &str, broadcaster_id: &str) -> Result<bool, VerifyError> {
        if access_token.is_empty() || broadcaster_id.is_empty() {
            return Err(VerifyError::MissingParameters);
        }

        let user_id = self.own_user_id(access_token).await?;

        let res = self
            .client
            .get(format!("{}/channels/followed", self.api_base))
            .bearer_auth(access_token)
            .header("Client-Id", &self.client_id)
            .query(&[
                ("user_id", user_id.as_str()),
                ("broadcaster_id", broadcaster_id),
            ])
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let follows: DataResponse<FollowItem> = res
            .json()
            .await
            .map_err(|e| VerifyError::Provider(format!("malformed follows response: {}", e)))?;

        Ok(!follows.data.is_empty())
    }

    async fn is_subscribed(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<bool, VerifyError> {
        if access_token.is_empty() || broadcaster_id.is_empty() {
            return Err(VerifyError::MissingParameters);
        }

        let user_id = self.own_user_id(access_token).await?;

        let res = self
            .client
            .get(format!("{}/subscriptions/user", self.api_base))
            .bearer_auth(access_token)
            .header("Client-Id", &self.client_id)
            .query(&[
                ("broadcaster_id", broadcaster_id),
                ("user_id", user_id.as_str()),
            ])
            .send()
            .await?;

        // Helix answers "not subscribed" with a 404, not an empty list
        if res.status().as_u16() == 404 {
            return Ok(false);
        }

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let subs: DataResponse<SubscriptionItem> = res
            .json()
            .await
            .map_err(|e| VerifyError::Provider(format!("malformed subscriptions response: {}", e)))?;

        Ok(!subs.data.is_empty())
    }
}
