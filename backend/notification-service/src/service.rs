//! Render-and-deliver handler for `notifications.send`.

use tracing::info;

use event_schema::events::NotificationSend;
use event_schema::EventEnvelope;

use crate::channels::ChannelRegistry;
use crate::error::{AppError, AppResult};
use crate::templates::{render, TemplateRegistry};

pub struct NotificationService {
    templates: TemplateRegistry,
    channels: ChannelRegistry,
}

impl NotificationService {
    pub fn new(templates: TemplateRegistry, channels: ChannelRegistry) -> Self {
        Self {
            templates,
            channels,
        }
    }

    pub async fn send(&self, envelope: &EventEnvelope<NotificationSend>) -> AppResult<()> {
        let request = &envelope.data;

        let template = self
            .templates
            .get(&request.template_id)
            .ok_or_else(|| AppError::UnknownTemplate(request.template_id.clone()))?;

        let subject = render(&template.subject, &request.variables);
        let body = render(&template.body, &request.variables);

        let channel = self.channels.get(&request.channel)?;
        channel
            .deliver(&request.customer_id, &subject, &body)
            .await?;

        info!(
            customer_id = %request.customer_id,
            template_id = %request.template_id,
            channel = %request.channel,
            correlation_id = %envelope.correlation_id,
            "Notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::NotificationChannel;
    use async_trait::async_trait;
    use event_schema::events::templates as template_ids;
    use event_schema::{sources, topics};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    struct RecordingChannel {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "email"
        }

        async fn deliver(&self, customer_id: &str, subject: &str, body: &str) -> AppResult<()> {
            self.sent.lock().unwrap().push((
                customer_id.to_string(),
                subject.to_string(),
                body.to_string(),
            ));
            Ok(())
        }
    }

    fn envelope(template_id: &str, channel: &str) -> EventEnvelope<NotificationSend> {
        let mut variables = HashMap::new();
        variables.insert("orderId".to_string(), "ord_1".to_string());
        variables.insert("reason".to_string(), "Out of stock".to_string());
        variables.insert("totalAmount".to_string(), "99.98".to_string());

        EventEnvelope::new(
            topics::NOTIFICATIONS_SEND,
            sources::ORDER_ORCHESTRATOR,
            Uuid::new_v4(),
            NotificationSend {
                customer_id: "cust_1".to_string(),
                channel: channel.to_string(),
                template_id: template_id.to_string(),
                variables,
            },
        )
    }

    fn service_with_recorder() -> (NotificationService, Arc<RecordingChannel>) {
        let recorder = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let service = NotificationService::new(
            TemplateRegistry::with_defaults(),
            ChannelRegistry::new(vec![recorder.clone() as Arc<dyn NotificationChannel>]),
        );
        (service, recorder)
    }

    #[tokio::test]
    async fn test_send_renders_and_delivers() {
        let (service, recorder) = service_with_recorder();

        service
            .send(&envelope(template_ids::ORDER_CANCELLED, "email"))
            .await
            .unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (customer_id, subject, body) = &sent[0];
        assert_eq!(customer_id, "cust_1");
        assert!(subject.contains("ord_1"));
        assert!(body.contains("Out of stock"));
    }

    #[tokio::test]
    async fn test_unknown_template_is_not_retryable() {
        let (service, _) = service_with_recorder();

        let err = service
            .send(&envelope("no-such-template", "email"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownTemplate(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_retryable() {
        let (service, _) = service_with_recorder();

        let err = service
            .send(&envelope(template_ids::ORDER_CONFIRMED, "sms"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownChannel(_)));
        assert!(!err.is_retryable());
    }
}
