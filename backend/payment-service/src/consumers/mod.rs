pub mod payment_events;

pub use payment_events::PaymentEventConsumer;
