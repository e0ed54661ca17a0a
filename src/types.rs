use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity provider (matches config and store rows)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Twitch,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Twitch => "twitch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "google" => Some(Provider::Google),
            "twitch" => Some(Provider::Twitch),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored access/refresh token pair for one user at one provider.
///
/// Unique on (user_id, provider); writes are upserts keyed on that pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// True when the access token is expired or expires inside `window`.
    /// A null expiry means "unknown, assume valid until a call fails".
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now + window,
            None => false,
        }
    }
}

/// YouTube relationship required to join a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YoutubeRequirement {
    None,
    Subscriber,
    Member,
}

/// Twitch relationship required to join a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwitchRequirement {
    None,
    Follower,
    Subscriber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRule {
    /// Allowed email addresses (contain '@') or bare domains
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoutubeRule {
    pub channel_id: String,
    pub requirement: YoutubeRequirement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchRule {
    pub broadcaster_id: String,
    pub requirement: TwitchRequirement,
}

/// Declarative access policy attached to a space, read at join time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube: Option<YoutubeRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitch: Option<TwitchRule>,
}

impl GatekeeperRule {
    /// A rule with no configured checks (or only `none` requirements) never blocks
    pub fn is_open(&self) -> bool {
        let youtube_active = self
            .youtube
            .as_ref()
            .is_some_and(|r| r.requirement != YoutubeRequirement::None);
        let twitch_active = self
            .twitch
            .as_ref()
            .is_some_and(|r| r.requirement != TwitchRequirement::None);
        let email_active = self.email.as_ref().is_some_and(|r| !r.allowed.is_empty());
        !youtube_active && !twitch_active && !email_active
    }
}

/// Per-item result of one refresh sweep. Exactly one of `refreshed` or
/// `skipped` is true on success paths; both false means `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub provider: Provider,
    pub user_id: String,
    pub refreshed: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefreshOutcome {
    pub fn refreshed(user_id: &str, provider: Provider) -> Self {
        Self {
            provider,
            user_id: user_id.to_string(),
            refreshed: true,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(user_id: &str, provider: Provider) -> Self {
        Self {
            provider,
            user_id: user_id.to_string(),
            refreshed: false,
            skipped: true,
            error: None,
        }
    }

    pub fn failed(user_id: &str, provider: Provider, error: String) -> Self {
        Self {
            provider,
            user_id: user_id.to_string(),
            refreshed: false,
            skipped: false,
            error: Some(error),
        }
    }
}

/// A sweep item that could not be refreshed, kept for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedToken {
    pub provider: Provider,
    pub user_id: String,
    pub error: String,
}

/// Aggregate summary of one refresh sweep: `total = refreshed + skipped + failed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tokens: Vec<FailedToken>,
}

impl SweepSummary {
    pub fn from_outcomes(outcomes: &[RefreshOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            refreshed: 0,
            skipped: 0,
            failed: 0,
            failed_tokens: Vec::new(),
        };

        for outcome in outcomes {
            if outcome.refreshed {
                summary.refreshed += 1;
            } else if outcome.skipped {
                summary.skipped += 1;
            } else {
                summary.failed += 1;
                summary.failed_tokens.push(FailedToken {
                    provider: outcome.provider,
                    user_id: outcome.user_id.clone(),
                    error: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
        }

        summary
    }
}

/// Closed set of allow/deny outcomes surfaced to the join flow.
///
/// Denials are specific so the UI can offer the correct remediation
/// (link account vs. re-authenticate vs. "you don't qualify").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Allowed,
    EmailNotAllowed,
    YoutubeVerificationRequired,
    YoutubeNotSubscribed,
    YoutubeNotMember,
    YoutubeCheckFailed,
    TwitchVerificationRequired,
    TwitchNotFollowing,
    TwitchNotSubscribed,
    TwitchCheckFailed,
    TokenExpired,
}

impl ReasonCode {
    pub fn as_label(&self) -> &'static str {
        match self {
            ReasonCode::Allowed => "ALLOWED",
            ReasonCode::EmailNotAllowed => "EMAIL_NOT_ALLOWED",
            ReasonCode::YoutubeVerificationRequired => "YOUTUBE_VERIFICATION_REQUIRED",
            ReasonCode::YoutubeNotSubscribed => "YOUTUBE_NOT_SUBSCRIBED",
            ReasonCode::YoutubeNotMember => "YOUTUBE_NOT_MEMBER",
            ReasonCode::YoutubeCheckFailed => "YOUTUBE_CHECK_FAILED",
            ReasonCode::TwitchVerificationRequired => "TWITCH_VERIFICATION_REQUIRED",
            ReasonCode::TwitchNotFollowing => "TWITCH_NOT_FOLLOWING",
            ReasonCode::TwitchNotSubscribed => "TWITCH_NOT_SUBSCRIBED",
            ReasonCode::TwitchCheckFailed => "TWITCH_CHECK_FAILED",
            ReasonCode::TokenExpired => "TOKEN_EXPIRED",
        }
    }
}

/// Outcome of one gatekeeper evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub allowed: bool,
    pub reason: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl VerificationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Allowed,
            details: None,
        }
    }

    pub fn denied(reason: ReasonCode) -> Self {
        Self {
            allowed: false,
            reason,
            details: None,
        }
    }

    pub fn denied_with(reason: ReasonCode, details: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            details: Some(details.into()),
        }
    }
}
