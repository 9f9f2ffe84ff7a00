//! Observability for the lock bridge
//!
//! Structured logging and in-process metrics. Metrics are logged as a
//! snapshot at shutdown; there is no HTTP exposure.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{device_span, lifecycle_span, mqtt_span};
