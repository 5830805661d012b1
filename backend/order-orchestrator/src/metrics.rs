use prometheus::{Histogram, HistogramOpts, IntCounter, Opts};
use tracing::warn;

/// Saga lifecycle metrics, registered on the default registry.
#[derive(Clone)]
pub struct SagaMetrics {
    pub started: IntCounter,
    pub completed: IntCounter,
    pub compensating: IntCounter,
    pub compensated: IntCounter,
    pub duration: Histogram,
}

impl SagaMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let started = IntCounter::with_opts(
            Opts::new("saga_started_total", "Number of sagas started")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for saga_started_total");

        let completed = IntCounter::with_opts(
            Opts::new(
                "saga_completed_total",
                "Number of sagas that reached COMPLETED",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for saga_completed_total");

        let compensating = IntCounter::with_opts(
            Opts::new(
                "saga_compensating_total",
                "Number of sagas that entered compensation",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for saga_compensating_total");

        let compensated = IntCounter::with_opts(
            Opts::new(
                "saga_compensated_total",
                "Number of sagas that finished compensation",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for saga_compensated_total");

        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "saga_duration_seconds",
                "Wall-clock time from saga start to a terminal state",
            )
            .const_label("service", service.to_string())
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .expect("valid metric opts for saga_duration_seconds");

        for metric in [
            Box::new(started.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(completed.clone()),
            Box::new(compensating.clone()),
            Box::new(compensated.clone()),
            Box::new(duration.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register saga metric: {}", e);
            }
        }

        Self {
            started,
            completed,
            compensating,
            compensated,
            duration,
        }
    }
}
