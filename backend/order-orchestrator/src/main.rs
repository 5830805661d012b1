use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;

use db_pool::DbConfig;
use idempotent_consumer::IdempotencyGuard;
use redis_utils::RedisPool;
use transactional_outbox::{
    KafkaOutboxPublisher, OutboxConfig, OutboxMetrics, OutboxProcessor, SqlxOutboxRepository,
};

use order_orchestrator::config::Config;
use order_orchestrator::consumers::SagaEventConsumer;
use order_orchestrator::error::AppError;
use order_orchestrator::events::PostgresEventSink;
use order_orchestrator::metrics::SagaMetrics;
use order_orchestrator::saga::{RedisSagaStore, SagaConfig, SagaOrchestrator};
use order_orchestrator::logging;

const SERVICE: &str = "order-orchestrator";

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
    let store = RedisSagaStore::new(redis_pool.manager(), cfg.saga.state_ttl);

    let outbox_repo = Arc::new(SqlxOutboxRepository::new(db.clone()));
    let sink = PostgresEventSink::new(db.clone(), outbox_repo.clone());

    let orchestrator = Arc::new(SagaOrchestrator::new(
        store,
        sink,
        SagaConfig {
            timeout: cfg.saga.timeout,
            grace: cfg.saga.grace,
        },
        SagaMetrics::new(SERVICE),
    ));

    // Idempotent producer: crash-driven relay re-publishes must not duplicate
    // on the wire.
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

    let consumer = SagaEventConsumer::new(cfg.kafka.clone(), guard, orchestrator, producer);
    consumer.start().await
}
