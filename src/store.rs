/// Credential store contract and implementations.
///
/// The store is the only shared mutable resource in the system. Uniqueness on
/// (user_id, provider) is enforced server-side by the data layer's unique key,
/// so a concurrent sweep and re-link can race without producing duplicate rows.
use crate::config::StoreConfig;
use crate::types::{Credential, Provider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// One atomic credential write: access + refresh + expiry replaced together
#[derive(Debug, Clone)]
pub struct CredentialUpdate {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>>;

    /// Upsert keyed on (user_id, provider) - replaces, never duplicates
    async fn upsert(&self, update: CredentialUpdate) -> Result<()>;

    /// Records with a refresh token that are expired, expiring inside
    /// `window`, or have unknown expiry. Records without a refresh token are
    /// structurally unrefreshable and never listed.
    async fn list_refreshable(&self, window: Duration) -> Result<Vec<Credential>>;
}

/// Client for the data layer's REST interface
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

#[derive(Serialize)]
struct UpsertRow<'a> {
    user_id: &'a str,
    provider: Provider,
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    expires_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl RestStore {
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("store.base_url not configured")?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/rest/v1/credentials", self.base_url)
    }
}

#[async_trait]
impl CredentialStore for RestStore {
    async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let res = self
            .client
            .get(self.endpoint())
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("provider", format!("eq.{}", provider)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .context("credential store unreachable")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("credential store read failed: {} {}", status, body);
        }

        let mut rows: Vec<Credential> = res.json().await.context("malformed store response")?;
        Ok(rows.pop())
    }

    async fn upsert(&self, update: CredentialUpdate) -> Result<()> {
        let row = UpsertRow {
            user_id: &update.user_id,
            provider: update.provider,
            access_token: &update.access_token,
            refresh_token: update.refresh_token.as_deref(),
            expires_at: update.expires_at,
            updated_at: Utc::now(),
        };

        let res = self
            .client
            .post(self.endpoint())
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates")
            .query(&[("on_conflict", "user_id,provider")])
            .json(&row)
            .send()
            .await
            .context("credential store unreachable")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("credential store upsert failed: {} {}", status, body);
        }

        Ok(())
    }

    async fn list_refreshable(&self, window: Duration) -> Result<Vec<Credential>> {
        let cutoff = (Utc::now() + window).to_rfc3339();

        let res = self
            .client
            .get(self.endpoint())
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .query(&[
                ("refresh_token", "not.is.null".to_string()),
                ("or", format!("(expires_at.is.null,expires_at.lt.{})", cutoff)),
            ])
            .send()
            .await
            .context("credential store unreachable")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("credential store listing failed: {} {}", status, body);
        }

        res.json().await.context("malformed store response")
    }
}

/// In-process store for tests and local development
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, Provider), Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&(user_id.to_string(), provider)).cloned())
    }

    async fn upsert(&self, update: CredentialUpdate) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let key = (update.user_id.clone(), update.provider);

        let created_at = rows.get(&key).map(|c| c.created_at).unwrap_or(now);
        rows.insert(
            key,
            Credential {
                user_id: update.user_id,
                provider: update.provider,
                access_token: update.access_token,
                refresh_token: update.refresh_token,
                expires_at: update.expires_at,
                created_at,
                updated_at: now,
            },
        );

        Ok(())
    }

    async fn list_refreshable(&self, window: Duration) -> Result<Vec<Credential>> {
        let now = Utc::now();
        let rows = self.rows.lock().unwrap();

        let mut due: Vec<Credential> = rows
            .values()
            .filter(|c| c.refresh_token.is_some())
            .filter(|c| c.expires_at.is_none() || c.expires_within(window, now))
            .cloned()
            .collect();

        // Stable order for deterministic sweeps
        due.sort_by(|a, b| (&a.user_id, a.provider.as_str()).cmp(&(&b.user_id, b.provider.as_str())));
        Ok(due)
    }
}
