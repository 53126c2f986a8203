use crate::config::MailConfig;
use crate::smtpclient::{SMTPClient, SMTPClientError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sends a rendered HTML notification to the fixed recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_html(&self, body: &str) -> Result<(), SMTPClientError>;
}

pub struct SmtpMailer {
    client: SMTPClient,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(config: Arc<MailConfig>) -> SmtpMailer {
        SmtpMailer {
            timeout: config.timeout,
            client: SMTPClient::new(config),
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_html(&self, body: &str) -> Result<(), SMTPClientError> {
        tokio::time::timeout(self.timeout, self.client.send(body))
            .await
            .map_err(|_| SMTPClientError::Timeout(self.timeout))?
    }
}
