//! # tw-observability
//!
//! Logging and metrics infrastructure for the Triage Warden playbook engine.
//!
//! This crate initialises structured logging with tracing, registers the
//! descriptions of the metrics the engine emits and aggregates execution
//! KPIs.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{describe_metrics, ExecutionKpis, MetricsCollector};
