//! Delivery channels behind a trait, so rendering stays independent of the
//! transport.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::SmtpTransport;
use lettre::{Message, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name as referenced in `notifications.send` payloads.
    fn name(&self) -> &'static str;

    async fn deliver(&self, customer_id: &str, subject: &str, body: &str) -> AppResult<()>;
}

/// SMTP email channel.
pub struct EmailChannel {
    config: SmtpConfig,
}

impl EmailChannel {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn create_transport(&self) -> SmtpTransport {
        let credentials = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );

        SmtpTransport::builder_dangerous(&self.config.host)
            .port(self.config.port)
            .credentials(credentials)
            .build()
    }

    /// Address resolution: the customer directory lives outside this service,
    /// so the recipient is synthesized from the configured domain.
    fn recipient_address(&self, customer_id: &str) -> String {
        format!("{customer_id}@{}", self.config.recipient_domain)
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, customer_id: &str, subject: &str, body: &str) -> AppResult<()> {
        let to_address = self.recipient_address(customer_id);

        let email = Message::builder()
            .from(
                format!("{} <{}>", self.config.from_name, self.config.from_email)
                    .parse()
                    .map_err(|e| AppError::Delivery(format!("invalid from address: {e}")))?,
            )
            .to(to_address
                .parse()
                .map_err(|e| AppError::Delivery(format!("invalid recipient address: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| AppError::Delivery(format!("failed to build email: {e}")))?;

        let mailer = self.create_transport();
        mailer
            .send(&email)
            .map_err(|e| AppError::Delivery(format!("SMTP send failed: {e}")))?;

        info!(customer_id = %customer_id, subject = %subject, "Email delivered");
        Ok(())
    }
}

/// Channels by name.
pub struct ChannelRegistry {
    channels: HashMap<&'static str, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| (channel.name(), channel))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> AppResult<&Arc<dyn NotificationChannel>> {
        self.channels
            .get(name)
            .ok_or_else(|| AppError::UnknownChannel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingChannel;

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, _customer_id: &str, _subject: &str, _body: &str) -> AppResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ChannelRegistry::new(vec![Arc::new(RecordingChannel)]);
        assert!(registry.get("recording").is_ok());
        assert!(matches!(
            registry.get("sms"),
            Err(AppError::UnknownChannel(_))
        ));
    }
}
