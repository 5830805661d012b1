use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;

use db_pool::DbConfig;
use idempotent_consumer::IdempotencyGuard;
use redis_utils::RedisPool;
use transactional_outbox::{
    KafkaOutboxPublisher, OutboxConfig, OutboxMetrics, OutboxProcessor, SqlxOutboxRepository,
};

use inventory_service::config::Config;
use inventory_service::consumers::InventoryEventConsumer;
use inventory_service::error::AppError;
use inventory_service::logging;
use inventory_service::service::InventoryService;

const SERVICE: &str = "inventory-service";

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    logging::init_tracing();

    let cfg = Arc::new(Config::from_env()?);

    let db_cfg = DbConfig::for_service(SERVICE).map_err(AppError::Config)?;
    db_cfg.log_config();
    let db = db_pool::create_pool(db_cfg).await?;

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .map_err(|e| AppError::Startup(format!("database migrations failed: {e}")))?;

    let redis_pool = RedisPool::connect(&cfg.redis_url)
        .await
        .map_err(|e| AppError::Startup(format!("redis: {e}")))?;
    let guard = IdempotencyGuard::with_ttl(redis_pool.manager(), cfg.idempotency_ttl);

    let outbox_repo = Arc::new(SqlxOutboxRepository::new(db.clone()));
    let service = Arc::new(InventoryService::new(
        db.clone(),
        outbox_repo.clone(),
        cfg.lock_max_retries,
    ));

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.kafka.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5")
        .create()
        .map_err(|e| AppError::Kafka(format!("failed to create producer: {e}")))?;

    let processor = OutboxProcessor::new(
        db.clone(),
        outbox_repo,
        Arc::new(KafkaOutboxPublisher::new(producer.clone())),
        OutboxConfig {
            batch_size: cfg.outbox.batch_size,
            poll_interval: cfg.outbox.poll_interval,
            max_retries: cfg.outbox.max_retries,
            backoff_base: cfg.outbox.backoff_base,
        },
    )
    .with_metrics(OutboxMetrics::new(SERVICE));

    tokio::spawn(async move {
        if let Err(e) = processor.start().await {
            tracing::error!(error = ?e, "Outbox relay exited");
        }
    });

    let consumer = InventoryEventConsumer::new(cfg.kafka.clone(), guard, service, producer);
    consumer.start().await
}
