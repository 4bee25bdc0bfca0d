//! Observability: structured logging, metrics and the health server

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{agent_span, channel_span, process_span, step_span};
