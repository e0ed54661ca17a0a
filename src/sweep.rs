/// Periodic credential refresh sweep.
///
/// Invoked per external trigger (timer-driven HTTP call or the `sweep` CLI
/// subcommand), runs to completion within that invocation. Items are
/// processed sequentially and independently: a crash mid-sweep leaves some
/// credentials refreshed and others not, which is safe because every item is
/// picked up again next sweep.
use crate::exchange::Exchangers;
use crate::store::{CredentialStore, CredentialUpdate};
use crate::types::{Credential, RefreshOutcome, SweepSummary};
use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

/// Run one sweep: refresh every stored credential that is expired, expiring
/// inside `window`, or has unknown expiry.
///
/// Returns `Err` only when the sweep cannot even start (store listing
/// failure); per-item failures are recorded in the summary and never abort
/// the remaining items.
pub async fn run_sweep(
    store: &dyn CredentialStore,
    exchangers: &Exchangers,
    window: Duration,
) -> Result<SweepSummary> {
    let candidates = store.list_refreshable(window).await?;
    info!(candidates = candidates.len(), "credential refresh sweep starting");

    let mut outcomes = Vec::with_capacity(candidates.len());
    for credential in &candidates {
        outcomes.push(refresh_one(store, exchangers, credential).await);
    }

    let summary = SweepSummary::from_outcomes(&outcomes);
    for failed in &summary.failed_tokens {
        crate::metrics::METRICS
            .sweep_outcomes_total
            .with_label_values(&["failed"])
            .inc();
        warn!(
            user_id = %failed.user_id,
            provider = %failed.provider,
            error = %failed.error,
            "credential refresh failed"
        );
    }
    crate::metrics::METRICS
        .sweep_outcomes_total
        .with_label_values(&["refreshed"])
        .inc_by(summary.refreshed as f64);
    crate::metrics::METRICS
        .sweep_outcomes_total
        .with_label_values(&["skipped"])
        .inc_by(summary.skipped as f64);

    info!(
        total = summary.total,
        refreshed = summary.refreshed,
        skipped = summary.skipped,
        failed = summary.failed,
        "credential refresh sweep finished"
    );

    Ok(summary)
}

async fn refresh_one(
    store: &dyn CredentialStore,
    exchangers: &Exchangers,
    credential: &Credential,
) -> RefreshOutcome {
    // Expected steady state for users who revoked consent, not a failure
    let Some(refresh_token) = credential.refresh_token.as_deref() else {
        debug!(
            user_id = %credential.user_id,
            provider = %credential.provider,
            "no refresh token, skipping"
        );
        return RefreshOutcome::skipped(&credential.user_id, credential.provider);
    };

    let exchanger = exchangers.for_provider(credential.provider);

    let refreshed = match exchanger.refresh(refresh_token).await {
        Ok(refreshed) => refreshed,
        Err(err) => {
            return RefreshOutcome::failed(
                &credential.user_id,
                credential.provider,
                err.to_string(),
            );
        }
    };

    // Anchor the absolute expiry to the response, not to schedule time
    let expires_at = refreshed.expires_at(Utc::now());

    // Keep the original refresh token when the provider did not rotate it
    let next_refresh_token = refreshed
        .refresh_token
        .or_else(|| Some(refresh_token.to_string()));

    let update = CredentialUpdate {
        user_id: credential.user_id.clone(),
        provider: credential.provider,
        access_token: refreshed.access_token,
        refresh_token: next_refresh_token,
        expires_at,
    };

    if let Err(err) = store.upsert(update).await {
        return RefreshOutcome::failed(&credential.user_id, credential.provider, err.to_string());
    }

    debug!(
        user_id = %credential.user_id,
        provider = %credential.provider,
        "credential refreshed"
    );
    RefreshOutcome::refreshed(&credential.user_id, credential.provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{TokenExchanger, TokenRefresh};
    use crate::store::MemoryStore;
    use crate::types::Provider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Scripted exchanger: per refresh token, either a response or an error
    struct ScriptedExchanger {
        provider: Provider,
        responses: HashMap<String, std::result::Result<TokenRefresh, String>>,
    }

    #[async_trait]
    impl TokenExchanger for ScriptedExchanger {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenRefresh> {
            match self.responses.get(refresh_token) {
                Some(Ok(refresh)) => Ok(refresh.clone()),
                Some(Err(msg)) => anyhow::bail!("{}", msg),
                None => anyhow::bail!("unexpected refresh token: {}", refresh_token),
            }
        }

        async fn exchange_code(&self, _code: &str, _redirect_uri: &str) -> Result<TokenRefresh> {
            anyhow::bail!("not used")
        }
    }

    fn ok_response(access: &str, refresh: Option<&str>) -> std::result::Result<TokenRefresh, String> {
        Ok(TokenRefresh {
            access_token: access.to_string(),
            refresh_token: refresh.map(|s| s.to_string()),
            expires_in: Some(3600),
        })
    }

    fn exchangers(
        google: HashMap<String, std::result::Result<TokenRefresh, String>>,
        twitch: HashMap<String, std::result::Result<TokenRefresh, String>>,
    ) -> Exchangers {
        Exchangers::new(
            Arc::new(ScriptedExchanger {
                provider: Provider::Google,
                responses: google,
            }),
            Arc::new(ScriptedExchanger {
                provider: Provider::Twitch,
                responses: twitch,
            }),
        )
    }

    async fn seed(store: &MemoryStore, user_id: &str, provider: Provider, refresh: Option<&str>) {
        store
            .upsert(CredentialUpdate {
                user_id: user_id.to_string(),
                provider,
                access_token: "stale".to_string(),
                refresh_token: refresh.map(|s| s.to_string()),
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_one_failure_never_aborts_the_sweep() {
        let store = MemoryStore::new();
        seed(&store, "u1", Provider::Google, Some("rt-ok")).await;
        seed(&store, "u2", Provider::Google, Some("rt-bad")).await;

        let mut google = HashMap::new();
        google.insert("rt-ok".to_string(), ok_response("fresh-at", None));
        google.insert("rt-bad".to_string(), Err("network error".to_string()));

        let summary = run_sweep(&store, &exchangers(google, HashMap::new()), Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed_tokens.len(), 1);
        assert_eq!(summary.failed_tokens[0].user_id, "u2");
        assert_eq!(summary.failed_tokens[0].error, "network error");

        // The successful item was persisted despite its neighbor failing
        let cred = store.get("u1", Provider::Google).await.unwrap().unwrap();
        assert_eq!(cred.access_token, "fresh-at");
    }

    #[tokio::test]
    async fn test_rotating_provider_replaces_refresh_token() {
        let store = MemoryStore::new();
        seed(&store, "u1", Provider::Twitch, Some("rt-old")).await;

        let mut twitch = HashMap::new();
        twitch.insert("rt-old".to_string(), ok_response("fresh-at", Some("rt-new")));

        let summary = run_sweep(&store, &exchangers(HashMap::new(), twitch), Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(summary.refreshed, 1);
        let cred = store.get("u1", Provider::Twitch).await.unwrap().unwrap();
        assert_eq!(cred.refresh_token.as_deref(), Some("rt-new"));
    }

    #[tokio::test]
    async fn test_non_rotating_provider_keeps_original_refresh_token() {
        let store = MemoryStore::new();
        seed(&store, "u1", Provider::Google, Some("rt-keep")).await;

        let mut google = HashMap::new();
        google.insert("rt-keep".to_string(), ok_response("fresh-at", None));

        run_sweep(&store, &exchangers(google, HashMap::new()), Duration::minutes(5))
            .await
            .unwrap();

        let cred = store.get("u1", Provider::Google).await.unwrap().unwrap();
        assert_eq!(cred.refresh_token.as_deref(), Some("rt-keep"));
    }

    #[tokio::test]
    async fn test_counts_always_reconcile() {
        let store = MemoryStore::new();
        seed(&store, "u1", Provider::Google, Some("rt-1")).await;
        seed(&store, "u2", Provider::Twitch, Some("rt-2")).await;
        seed(&store, "u3", Provider::Twitch, Some("rt-3")).await;

        let mut google = HashMap::new();
        google.insert("rt-1".to_string(), ok_response("at", None));
        let mut twitch = HashMap::new();
        twitch.insert("rt-2".to_string(), Err("timed out".to_string()));
        twitch.insert("rt-3".to_string(), ok_response("at", Some("rt-3b")));

        let summary = run_sweep(&store, &exchangers(google, twitch), Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(summary.total, summary.refreshed + summary.skipped + summary.failed);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.refreshed, 2);
        assert_eq!(summary.failed, 1);
    }

    /// Store whose listing is stale: it hands back rows as they looked at
    /// query time, simulating a consent revocation racing the sweep.
    struct StaleListingStore {
        inner: MemoryStore,
        listed: Vec<Credential>,
    }

    #[async_trait]
    impl CredentialStore for StaleListingStore {
        async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
            self.inner.get(user_id, provider).await
        }

        async fn upsert(&self, update: CredentialUpdate) -> Result<()> {
            self.inner.upsert(update).await
        }

        async fn list_refreshable(&self, _window: Duration) -> Result<Vec<Credential>> {
            Ok(self.listed.clone())
        }
    }

    #[tokio::test]
    async fn test_missing_refresh_token_at_point_of_use_is_skipped_not_failed() {
        let now = Utc::now();
        let store = StaleListingStore {
            inner: MemoryStore::new(),
            listed: vec![Credential {
                user_id: "u1".to_string(),
                provider: Provider::Google,
                access_token: "at".to_string(),
                refresh_token: None,
                expires_at: Some(now - Duration::minutes(1)),
                created_at: now,
                updated_at: now,
            }],
        };

        // Exchanger with no scripted responses: any call would fail the test
        let summary = run_sweep(
            &store,
            &exchangers(HashMap::new(), HashMap::new()),
            Duration::minutes(5),
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_summary() {
        let store = MemoryStore::new();
        let summary = run_sweep(
            &store,
            &exchangers(HashMap::new(), HashMap::new()),
            Duration::minutes(5),
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 0);
        assert!(summary.failed_tokens.is_empty());
    }
}
