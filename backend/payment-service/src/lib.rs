//! Payment participant of the Orderflow saga.
//!
//! Charges through a gateway seam, idempotent by order id; refunds during
//! compensation, idempotent by payment id; answers through the transactional
//! outbox.

pub mod config;
pub mod consumers;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod repository;
pub mod service;
