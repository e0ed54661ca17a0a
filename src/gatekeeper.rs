/// Join eligibility evaluation for one user against one space's rule.
///
/// Pure given its collaborators: the only side effects are the provider API
/// calls made by the verifiers. Every deny carries a specific reason so the
/// join flow can offer the correct remediation.
use crate::store::CredentialStore;
use crate::types::{
    GatekeeperRule, Provider, ReasonCode, TwitchRequirement, VerificationResult,
    YoutubeRequirement,
};
use crate::verify::{TwitchRelationships, VerifyError, YoutubeRelationships};
use std::sync::Arc;
use tracing::{debug, warn};

/// One user asking to join a space
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user_id: String,
    /// Verified email, empty when the identity backend has none
    pub email: String,
    /// The space owner - membership lists are only visible to the owner's
    /// own credential
    pub owner_id: String,
}

/// How multiple configured rule types combine. Kept as an explicit, named
/// policy so product intent can change without touching the evaluator's
/// control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinePolicy {
    /// Every configured, non-`none` requirement must pass
    All,
}

/// Fold individual check results under the active policy
pub fn combine(policy: CombinePolicy, results: Vec<VerificationResult>) -> VerificationResult {
    match policy {
        CombinePolicy::All => results
            .into_iter()
            .find(|r| !r.allowed)
            .unwrap_or_else(VerificationResult::allowed),
    }
}

pub struct Gatekeeper {
    store: Arc<dyn CredentialStore>,
    youtube: Arc<dyn YoutubeRelationships>,
    twitch: Arc<dyn TwitchRelationships>,
    policy: CombinePolicy,
}

impl Gatekeeper {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        youtube: Arc<dyn YoutubeRelationships>,
        twitch: Arc<dyn TwitchRelationships>,
    ) -> Self {
        Self {
            store,
            youtube,
            twitch,
            policy: CombinePolicy::All,
        }
    }

    pub async fn evaluate(
        &self,
        rule: &GatekeeperRule,
        candidate: &Candidate,
    ) -> VerificationResult {
        let mut results = Vec::new();

        if let Some(email_rule) = &rule.email {
            if !email_rule.allowed.is_empty() {
                results.push(self.check_email(&email_rule.allowed, &candidate.email));
            }
        }

        // Under All, the first failed check decides; skip the remaining
        // provider calls once the outcome is settled.
        if results.iter().all(|r| r.allowed) {
            if let Some(youtube_rule) = &rule.youtube {
                if youtube_rule.requirement != YoutubeRequirement::None {
                    results.push(self.check_youtube(youtube_rule, candidate).await);
                }
            }
        }

        if results.iter().all(|r| r.allowed) {
            if let Some(twitch_rule) = &rule.twitch {
                if twitch_rule.requirement != TwitchRequirement::None {
                    results.push(self.check_twitch(twitch_rule, candidate).await);
                }
            }
        }

        let result = combine(self.policy, results);
        crate::metrics::METRICS
            .gatekeeper_decisions_total
            .with_label_values(&[result.reason.as_label()])
            .inc();
        debug!(
            user_id = %candidate.user_id,
            allowed = result.allowed,
            reason = ?result.reason,
            "gatekeeper decision"
        );
        result
    }

    fn check_email(&self, allowed: &[String], email: &str) -> VerificationResult {
        if email_allowed(allowed, email) {
            VerificationResult::allowed()
        } else {
            VerificationResult::denied(ReasonCode::EmailNotAllowed)
        }
    }

    async fn check_youtube(
        &self,
        rule: &crate::types::YoutubeRule,
        candidate: &Candidate,
    ) -> VerificationResult {
        let credential = match self.store.get(&candidate.user_id, Provider::Google).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return VerificationResult::denied(ReasonCode::YoutubeVerificationRequired);
            }
            Err(err) => {
                warn!(error = %err, "credential lookup failed during evaluation");
                return VerificationResult::denied_with(
                    ReasonCode::YoutubeCheckFailed,
                    err.to_string(),
                );
            }
        };

        let checked = match rule.requirement {
            YoutubeRequirement::None => return VerificationResult::allowed(),
            YoutubeRequirement::Subscriber => {
                self.youtube
                    .is_subscriber(&credential.access_token, &rule.channel_id)
                    .await
            }
            YoutubeRequirement::Member => {
                let owner = match self.store.get(&candidate.owner_id, Provider::Google).await {
                    Ok(Some(owner)) => owner,
                    Ok(None) => {
                        return VerificationResult::denied_with(
                            ReasonCode::YoutubeCheckFailed,
                            "space owner has no linked google account",
                        );
                    }
                    Err(err) => {
                        return VerificationResult::denied_with(
                            ReasonCode::YoutubeCheckFailed,
                            err.to_string(),
                        );
                    }
                };

                self.youtube
                    .is_member(&credential.access_token, &owner.access_token)
                    .await
            }
        };

        match checked {
            Ok(true) => VerificationResult::allowed(),
            Ok(false) => match rule.requirement {
                YoutubeRequirement::Member => {
                    VerificationResult::denied(ReasonCode::YoutubeNotMember)
                }
                _ => VerificationResult::denied(ReasonCode::YoutubeNotSubscribed),
            },
            Err(VerifyError::TokenExpired) => VerificationResult::denied_with(
                ReasonCode::TokenExpired,
                Provider::Google.as_str(),
            ),
            Err(err) => {
                VerificationResult::denied_with(ReasonCode::YoutubeCheckFailed, err.to_string())
            }
        }
    }

    async fn check_twitch(
        &self,
        rule: &crate::types::TwitchRule,
        candidate: &Candidate,
    ) -> VerificationResult {
        let credential = match self.store.get(&candidate.user_id, Provider::Twitch).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return VerificationResult::denied(ReasonCode::TwitchVerificationRequired);
            }
            Err(err) => {
                warn!(error = %err, "credential lookup failed during evaluation");
                return VerificationResult::denied_with(
                    ReasonCode::TwitchCheckFailed,
                    err.to_string(),
                );
            }
        };

        let checked = match rule.requirement {
            TwitchRequirement::None => return VerificationResult::allowed(),
            TwitchRequirement::Follower => {
                self.twitch
                    .follows(&credential.access_token, &rule.broadcaster_id)
                    .await
            }
            TwitchRequirement::Subscriber => {
                self.twitch
                    .is_subscribed(&credential.access_token, &rule.broadcaster_id)
                    .await
            }
        };

        match checked {
            Ok(true) => VerificationResult::allowed(),
            Ok(false) => match rule.requirement {
                TwitchRequirement::Follower => {
                    VerificationResult::denied(ReasonCode::TwitchNotFollowing)
                }
                _ => VerificationResult::denied(ReasonCode::TwitchNotSubscribed),
            },
            Err(VerifyError::TokenExpired) => VerificationResult::denied_with(
                ReasonCode::TokenExpired,
                Provider::Twitch.as_str(),
            ),
            Err(err) => {
                VerificationResult::denied_with(ReasonCode::TwitchCheckFailed, err.to_string())
            }
        }
    }
}

/// Exact address match, or domain match when the allowlist entry carries no
/// '@'. Comparison is case-insensitive.
fn email_allowed(allowed: &[String], email: &str) -> bool {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return false;
    }

    let domain = email.rsplit('@').next().unwrap_or_default();

    allowed.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        if entry.contains('@') {
            entry == email
        } else {
            !entry.is_empty() && entry == domain
        }
    })
}
