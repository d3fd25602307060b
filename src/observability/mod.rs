//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging via tracing
//! - OpenTelemetry metrics for publishes and deliveries

pub mod metrics;
pub mod tracing;
