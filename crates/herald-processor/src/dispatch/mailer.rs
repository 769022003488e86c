//! Mail transport seam.
//!
//! Herald does not speak SMTP. Messages are handed to a mail relay over
//! HTTP; the relay owns templates, rendering and delivery.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use herald_core::JobAction;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

use crate::error::{ProcessorError, Result};

/// Sends one action email.
#[async_trait]
pub trait Mailer: Send + Sync + fmt::Debug {
    /// Sends the message for `action` to `recipient` in `lang`, embedding
    /// `token` in its link.
    async fn send(&self, action: JobAction, recipient: &str, lang: &str, token: &str)
        -> Result<()>;
}

/// Settings of [`HttpMailer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Endpoint that accepts send requests.
    pub relay_url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8025/api/send".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: format!("herald/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Body posted to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Template to render.
    pub action: JobAction,
    /// Recipient address.
    pub recipient: String,
    /// Template language.
    pub lang: String,
    /// Token for the action link.
    pub token: String,
}

/// Mailer posting JSON to a relay.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailerConfig,
}

impl HttpMailer {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Configuration` if the client cannot be built.
    pub fn new(config: MailerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                ProcessorError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(
        &self,
        action: JobAction,
        recipient: &str,
        lang: &str,
        token: &str,
    ) -> Result<()> {
        let body = SendRequest {
            action,
            recipient: recipient.to_string(),
            lang: lang.to_string(),
            token: token.to_string(),
        };
        let span = info_span!("mail_send", %action, recipient, lang);

        async {
            let response = self
                .client
                .post(&self.config.relay_url)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ProcessorError::dispatch(format!(
                            "relay timed out after {:?}",
                            self.config.timeout
                        ))
                    } else {
                        ProcessorError::dispatch(format!("relay unreachable: {e}"))
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(ProcessorError::dispatch(format!(
                    "relay rejected message with {status}: {detail}"
                )));
            }

            debug!(%status, "relay accepted message");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
