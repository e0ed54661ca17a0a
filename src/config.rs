use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    pub webhook: WebhookConfig,
    pub mailer: MailerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Connection settings for the external data layer holding credential rows.
/// With no `base_url` the in-process store is used (local development only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub service_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub google: OAuthClientConfig,
    pub twitch: OAuthClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Token endpoint override (test seam)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// Relationship API base override (test seam)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Bearer token guarding the periodic refresh trigger
    #[serde(default)]
    pub token: String,
    /// Credentials expiring inside this window are refreshed
    #[serde(default = "default_expiry_window")]
    pub expiry_window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Signing secret, accepted as `v1,<key>` or bare `<key>`
    pub secret: String,
    #[serde(default = "default_tolerance")]
    pub timestamp_tolerance_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    pub api_key: String,
    #[serde(default = "default_mailer_url")]
    pub base_url: String,
    pub from: String,
    /// Base URL verification links point at
    pub site_url: String,
}

// Defaults
fn default_http_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_timeout_secs() -> u64 { 10 }
fn default_expiry_window() -> i64 { 300 }
fn default_tolerance() -> i64 { 300 }
fn default_mailer_url() -> String { "https://api.resend.com".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            expiry_window_secs: default_expiry_window(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("SPACEGATE_CONFIG").unwrap_or_else(|_| {
            let home_config = format!(
                "{}/.config/spacegate/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec![
                "./config.toml",
                "./spacegate.toml",
                "/etc/spacegate/config.toml",
                home_config.as_str(),
            ];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            "./config.toml".to_string()
        });

        // Config carries service keys and signing secrets
        #[cfg(unix)]
        Self::validate_file_permissions(&config_path)?;

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        let config_content = Self::substitute_env_vars(&config_content);

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = env::var(var_name).unwrap_or_default();
                result.replace_range(start..start + end + 1, &value);
            } else {
                break;
            }
        }

        result
    }

    /// Missing secrets are fatal at startup, never discovered mid-request
    pub fn validate(&self) -> Result<()> {
        if let Some(base_url) = &self.store.base_url {
            url::Url::parse(base_url)
                .with_context(|| format!("store.base_url is not a valid URL: {}", base_url))?;
            if self.store.service_key.is_empty() {
                anyhow::bail!("store.service_key is required when store.base_url is set");
            }
        } else {
            tracing::warn!("store.base_url not set - using in-process credential store");
        }

        if self.providers.google.client_secret.is_empty() {
            anyhow::bail!("providers.google.client_secret is not configured");
        }
        if self.providers.twitch.client_secret.is_empty() {
            anyhow::bail!("providers.twitch.client_secret is not configured");
        }
        if self.webhook.secret.is_empty() {
            anyhow::bail!("webhook.secret is not configured");
        }
        if self.mailer.api_key.is_empty() {
            anyhow::bail!("mailer.api_key is not configured");
        }
        url::Url::parse(&self.mailer.site_url)
            .with_context(|| format!("mailer.site_url is not a valid URL: {}", self.mailer.site_url))?;

        if self.sweep.token.is_empty() {
            tracing::warn!("sweep.token not set - the refresh trigger will reject all callers");
        }

        Ok(())
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        if !path_obj.exists() {
            tracing::debug!("Config file does not exist yet: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;

        let mode = metadata.permissions().mode();

        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "Config file {} has insecure permissions: {:o}",
                path,
                mode & 0o777
            );
            tracing::warn!(
                "Recommended: chmod 600 {} - it contains signing secrets and service keys",
                path
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}
