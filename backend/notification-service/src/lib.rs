//! Notification participant of the Orderflow saga.
//!
//! Renders workflow templates and delivers them through pluggable channels.
//! Consumes `notifications.send`; emits nothing back to the saga.

pub mod channels;
pub mod config;
pub mod consumers;
pub mod error;
pub mod logging;
pub mod service;
pub mod templates;
