//! Inventory participant of the Orderflow saga.
//!
//! Reserves stock under optimistic concurrency when the orchestrator asks,
//! releases it again during compensation, and answers through the
//! transactional outbox.

pub mod config;
pub mod consumers;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;
pub mod service;
