//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - Structured tracing to stderr, plain or JSON
//! - OTLP metrics for engine operations and pool pressure

pub mod metrics;
pub mod tracing;
