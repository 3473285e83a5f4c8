//! Telemetry: structured logging and the metric names emitted by the core.
//!
//! - **Logging**: JSON/pretty/compact `tracing-subscriber` output with
//!   per-module level overrides
//! - **Metrics**: counters published through the `metrics` facade; the
//!   embedding process decides which recorder/exporter to install
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::register_metrics;
