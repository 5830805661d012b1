use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;

use idempotent_consumer::IdempotencyGuard;
use redis_utils::RedisPool;

use notification_service::channels::{ChannelRegistry, EmailChannel, NotificationChannel};
use notification_service::config::Config;
use notification_service::consumers::NotificationEventConsumer;
use notification_service::error::AppError;
use notification_service::logging;
use notification_service::service::NotificationService;
use notification_service::templates::TemplateRegistry;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    logging::init_tracing();

    let cfg = Arc::new(Config::from_env()?);

    let redis_pool = RedisPool::connect(&cfg.redis_url)
        .await
        .map_err(|e| AppError::Startup(format!("redis: {e}")))?;
    let guard = IdempotencyGuard::with_ttl(redis_pool.manager(), cfg.idempotency_ttl);

    let email = Arc::new(EmailChannel::new(cfg.smtp.clone()));
    let service = Arc::new(NotificationService::new(
        TemplateRegistry::with_defaults(),
        ChannelRegistry::new(vec![email as Arc<dyn NotificationChannel>]),
    ));

    let dlq_producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.kafka.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .create()
        .map_err(|e| AppError::Kafka(format!("failed to create producer: {e}")))?;

    let consumer = NotificationEventConsumer::new(cfg.kafka.clone(), guard, service, dlq_producer);
    consumer.start().await
}
