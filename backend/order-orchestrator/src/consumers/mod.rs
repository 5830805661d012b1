pub mod saga_events;

pub use saga_events::{RetryPolicy, SagaEventConsumer};
