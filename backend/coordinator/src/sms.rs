//! Outbound text messages.
//!
//! [`HttpSms`] talks to a Twilio-compatible REST API. When no credentials are
//! configured the service falls back to [`LogOnlySms`], which records that a
//! message would have been sent without revealing its body.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SmsCredentials;
use crate::errors::{AppError, Result};

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Send `body` to an E.164 number. Returns the provider's message id.
    async fn send(&self, to: &str, body: &str) -> Result<String>;
}

// ─────────────────────────────────────────────────────────
// REST response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageCreated {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    code: Option<i64>,
    message: String,
}

// ─────────────────────────────────────────────────────────
// HTTP sender
// ─────────────────────────────────────────────────────────

pub struct HttpSms {
    client: Client,
    base_url: String,
    credentials: SmsCredentials,
}

impl HttpSms {
    pub fn new(client: Client, base_url: impl Into<String>, credentials: SmsCredentials) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            credentials,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.credentials.account_sid
        )
    }
}

#[async_trait]
impl SmsSender for HttpSms {
    async fn send(&self, to: &str, body: &str) -> Result<String> {
        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.credentials.account_sid,
                Some(&self.credentials.auth_token),
            )
            .form(&[
                ("To", to),
                ("From", self.credentials.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::Internal("SMS provider rate-limited the request".to_string()));
        }
        if !status.is_success() {
            let detail = match resp.json::<ProviderError>().await {
                Ok(err) => format!("{} ({:?})", err.message, err.code),
                Err(_) => status.to_string(),
            };
            return Err(AppError::Internal(format!("SMS provider rejected message: {detail}")));
        }

        let created: MessageCreated = resp.json().await?;
        debug!("SMS accepted by provider: {}", created.sid);
        Ok(created.sid)
    }
}

// ─────────────────────────────────────────────────────────
// Log-only sender
// ─────────────────────────────────────────────────────────

pub struct LogOnlySms;

#[async_trait]
impl SmsSender for LogOnlySms {
    async fn send(&self, to: &str, _body: &str) -> Result<String> {
        info!("Messaging not configured; SMS to {to} not sent");
        Ok("log-only".to_string())
    }
}
