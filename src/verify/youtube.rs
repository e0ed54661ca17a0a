/// YouTube Data API relationship checks.
use crate::config::OAuthClientConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{classify_response, VerifyError, YoutubeRelationships};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on membership pagination. Natural termination is the provider
/// returning no next-page token; the ceiling guards against a misbehaving
/// response that keeps handing one back.
const MAX_MEMBER_PAGES: usize = 20;

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ListResponse<T> {
    #[serde(default)]
    items: Vec<T>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ChannelItem {
    id: String,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    #[allow(dead_code)]
    id: String,
}

#[derive(Deserialize)]
struct MemberItem {
    snippet: MemberSnippet,
}

#[derive(Deserialize)]
struct MemberSnippet {
    #[serde(rename = "memberDetails")]
    member_details: MemberDetails,
}

#[derive(Deserialize)]
struct MemberDetails {
    #[serde(rename = "channelId")]
    channel_id: String,
}

pub struct YoutubeVerifier {
    client: reqwest::Client,
    api_base: String,
}

impl YoutubeVerifier {
    pub fn from_config(config: &OAuthClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| API_BASE.to_string()),
        })
    }

    /// The channel id behind an access token (`channels?mine=true`)
    async fn own_channel_id(&self, access_token: &str) -> Result<Option<String>, VerifyError> {
        let res = self
            .client
            .get(format!("{}/channels", self.api_base))
            .bearer_auth(access_token)
            .query(&[("part", "id"), ("mine", "true")])
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let channels: ListResponse<ChannelItem> = res
            .json()
            .await
            .map_err(|e| VerifyError::Provider(format!("malformed channels response: {}", e)))?;

        Ok(channels.items.into_iter().next().map(|c| c.id))
    }
}

#[async_trait]
impl YoutubeRelationships for YoutubeVerifier {
    async fn is_subscriber(
        &self,
        access_token: &str,
        channel_id: &str,
    ) -> Result<bool, VerifyError> {
        if access_token.is_empty() || channel_id.is_empty() {
            return Err(VerifyError::MissingParameters);
        }

        let res = self
            .client
            .get(format!("{}/subscriptions", self.api_base))
            .bearer_auth(access_token)
            .query(&[
                ("part", "snippet"),
                ("mine", "true"),
                ("forChannelId", channel_id),
            ])
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let subs: ListResponse<SubscriptionItem> = res
            .json()
            .await
            .map_err(|e| VerifyError::Provider(format!("malformed subscriptions response: {}", e)))?;

        Ok(!subs.items.is_empty())
    }

    async fn is_member(
        &self,
        participant_token: &str,
        owner_token: &str,
    ) -> Result<bool, VerifyError> {
        if participant_token.is_empty() || owner_token.is_empty() {
            return Err(VerifyError::MissingParameters);
        }

        // Membership lists only expose channel ids, so resolve the
        // participant's channel first, with the participant's own token.
        let Some(member_channel_id) = self.own_channel_id(participant_token).await? else {
            return Ok(false);
        };

        // Paginate the owner's member list until match or no next page
        let mut page_token: Option<String> = None;
        for page in 0..MAX_MEMBER_PAGES {
            let mut query = vec![
                ("part".to_string(), "snippet".to_string()),
                ("maxResults".to_string(), "50".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let res = self
                .client
                .get(format!("{}/members", self.api_base))
                .bearer_auth(owner_token)
                .query(&query)
                .send()
                .await?;

            if !res.status().is_success() {
                return Err(classify_response(res).await);
            }

            let members: ListResponse<MemberItem> = res
                .json()
                .await
                .map_err(|e| VerifyError::Provider(format!("malformed members response: {}", e)))?;

            if members
                .items
                .iter()
                .any(|m| m.snippet.member_details.channel_id == member_channel_id)
            {
                return Ok(true);
            }

            match members.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(false),
            }

            debug!(page, "membership page exhausted, continuing");
        }

        debug!(
            max_pages = MAX_MEMBER_PAGES,
            "membership pagination ceiling reached without a match"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(api_base: String) -> YoutubeVerifier {
        YoutubeVerifier::from_config(&OAuthClientConfig {
            client_id: "gid".to_string(),
            client_secret: "gsecret".to_string(),
            token_url: None,
            api_base: Some(api_base),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_parameters_short_circuit() {
        // Unroutable base: any network call would error loudly
        let verifier = verifier("http://127.0.0.1:1".to_string());

        assert!(matches!(
            verifier.is_subscriber("", "UC123").await,
            Err(VerifyError::MissingParameters)
        ));
        assert!(matches!(
            verifier.is_subscriber("token", "").await,
            Err(VerifyError::MissingParameters)
        ));
        assert!(matches!(
            verifier.is_member("", "owner-token").await,
            Err(VerifyError::MissingParameters)
        ));
    }

    #[tokio::test]
    async fn test_is_subscriber_true_when_items_present() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions")
            .match_query(mockito::Matcher::UrlEncoded(
                "forChannelId".into(),
                "UC123".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"id":"sub-1"}]}"#)
            .create_async()
            .await;

        let verifier = verifier(server.url());
        assert!(verifier.is_subscriber("token", "UC123").await.unwrap());
    }

    #[tokio::test]
    async fn test_is_subscriber_false_when_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[]}"#)
            .create_async()
            .await;

        let verifier = verifier(server.url());
        assert!(!verifier.is_subscriber("token", "UC123").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_token_maps_to_token_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let verifier = verifier(server.url());
        assert!(matches!(
            verifier.is_subscriber("stale", "UC123").await,
            Err(VerifyError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_membership_found_on_second_page() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/channels")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"id":"UCmember"}]}"#)
            .create_async()
            .await;

        server
            .mock("GET", "/members")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("part".into(), "snippet".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"items":[{"snippet":{"memberDetails":{"channelId":"UCother"}}}],"nextPageToken":"p2"}"#,
            )
            .create_async()
            .await;

        server
            .mock("GET", "/members")
            .match_query(mockito::Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"snippet":{"memberDetails":{"channelId":"UCmember"}}}]}"#)
            .create_async()
            .await;

        let verifier = verifier(server.url());
        assert!(verifier.is_member("member-token", "owner-token").await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_terminates_without_next_page() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/channels")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"id":"UCmember"}]}"#)
            .create_async()
            .await;

        server
            .mock("GET", "/members")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"snippet":{"memberDetails":{"channelId":"UCother"}}}]}"#)
            .create_async()
            .await;

        let verifier = verifier(server.url());
        assert!(!verifier.is_member("member-token", "owner-token").await.unwrap());
    }
}
