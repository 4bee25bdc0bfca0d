//! Structured logging using the tracing crate
//!
//! Provides machine-readable logging with span macros for the orchestration
//! layers: process runs, individual steps, agent invocations and operator
//! channels.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE. Defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact. Defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false). Defaults to false
//! - `RUST_LOG`: overrides filtering entirely (env_logger syntax)
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO ./draftflow run --brief "..."
//!
//! # Development with colors
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./draftflow run --brief "..."
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON (machine-readable)
    Json,
    /// Colors and indentation (human-readable)
    Pretty,
    /// Colors with minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, falling back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, falling back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    // Quiet the transport and HTTP stacks
    ["rumqttc=warn", "hyper=warn", "reqwest=warn", "warp=warn"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration. A second call is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    // Logs go to stderr so the console channel owns stdout
    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span covering one run of a process
#[macro_export]
macro_rules! process_span {
    ($($field:tt)*) => {
        tracing::info_span!("process_run", $($field)*)
    };
}

/// Span covering one step of a run
#[macro_export]
macro_rules! step_span {
    ($($field:tt)*) => {
        tracing::info_span!("step_execution", $($field)*)
    };
}

/// Span covering one agent invocation, retries included
#[macro_export]
macro_rules! agent_span {
    ($($field:tt)*) => {
        tracing::info_span!("agent_invocation", $($field)*)
    };
}

/// Span covering an operator channel's lifetime
#[macro_export]
macro_rules! channel_span {
    ($($field:tt)*) => {
        tracing::info_span!("operator_channel", $($field)*)
    };
}

pub use crate::{agent_span, channel_span, process_span, step_span};
