/// Outbound transactional email over the mail provider's HTTP API.
use crate::config::MailerConfig;
use crate::webhook::OutboundEmail;
use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

pub struct Mailer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl Mailer {
    pub fn from_config(config: &MailerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        })
    }

    pub async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let request = SendRequest {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
        };

        let res = self
            .client
            .post(format!("{}/emails", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            anyhow::bail!("email send failed: {} {}", status, error_text);
        }

        info!(to = %email.to, subject = %email.subject, "email sent");
        Ok(())
    }
}
