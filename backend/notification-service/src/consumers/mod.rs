pub mod notification_events;

pub use notification_events::NotificationEventConsumer;
