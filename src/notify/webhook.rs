use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{Notifier, NotifyError};

/// IFTTT-style maker webhook: `GET <base>/trigger/<channel>/with/key/<token>?value1=<message>`
pub struct WebhookNotifier {
    http: Client,
    base_url: String,
    channel: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        base_url: impl Into<String>,
        channel: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            channel: channel.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn trigger_url(&self, token: &str) -> String {
        format!("{}/trigger/{}/with/key/{}", self.base_url, self.channel, token)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let token = self.token.as_deref().ok_or(NotifyError::MissingToken)?;

        let response = self
            .http
            .get(self.trigger_url(token))
            .query(&[("value1", message)])
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Request(format!("webhook returned {status}")));
        }

        debug!(channel = %self.channel, "Webhook delivered");
        Ok(())
    }
}
