//! SAHAY backend daemon.
//!
//! Wires the `sahay-core` subsystems behind an axum HTTP surface, runs the
//! periodic jobs (SLA ticks, anchor retries, outbox dispatch, aggregation
//! flushes, view refreshes) under advisory locks, and exposes Prometheus
//! metrics.

pub mod config;
pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod state;
