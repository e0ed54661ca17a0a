pub mod twitch;
pub mod youtube;

use async_trait::async_trait;
use thiserror::Error;

pub use twitch::TwitchVerifier;
pub use youtube::YoutubeVerifier;

/// Errors from a relationship check, classified so the gatekeeper can tell
/// "not eligible" from "cannot verify right now".
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("missing parameters for relationship check")]
    MissingParameters,
    #[error("provider token expired or revoked")]
    TokenExpired,
    #[error("token lacks required scope or permissions")]
    InsufficientPermissions,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for VerifyError {
    fn from(err: reqwest::Error) -> Self {
        VerifyError::Network(err.to_string())
    }
}

/// Single classification routine shared by all adapters:
/// 401 means the token is stale, 403 means it lacks scope, anything else
/// surfaces the provider's own message.
pub(crate) async fn classify_response(res: reqwest::Response) -> VerifyError {
    let status = res.status();
    match status.as_u16() {
        401 => VerifyError::TokenExpired,
        403 => VerifyError::InsufficientPermissions,
        _ => {
            let body = res.text().await.unwrap_or_default();
            VerifyError::Provider(format!("{} {}", status, body))
        }
    }
}

/// YouTube relationship checks against a channel
#[async_trait]
pub trait YoutubeRelationships: Send + Sync {
    /// Is the token's owner subscribed to `channel_id`?
    async fn is_subscriber(&self, access_token: &str, channel_id: &str)
        -> Result<bool, VerifyError>;

    /// Is the participant a paid member of the owner's channel? Membership
    /// lists are only visible to the channel owner, so this takes both
    /// tokens.
    async fn is_member(
        &self,
        participant_token: &str,
        owner_token: &str,
    ) -> Result<bool, VerifyError>;
}

/// Twitch relationship checks against a broadcaster
#[async_trait]
pub trait TwitchRelationships: Send + Sync {
    async fn follows(&self, access_token: &str, broadcaster_id: &str) -> Result<bool, VerifyError>;

    async fn is_subscribed(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<bool, VerifyError>;
}
