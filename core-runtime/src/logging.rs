//! # Logging & Tracing Infrastructure
//!
//! Structured logging for the sync engine with the `tracing` crate:
//! - JSON, pretty and compact output formats
//! - Crate-level filtering, overridable through `RUST_LOG`
//! - Redaction of credentials before they leave the process
//! - Mirroring into a host logger through [`LoggerSink`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::LogLevel;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LoggingConfig::default()
//!         .with_format(LogFormat::Json)
//!         .with_level(LogLevel::Debug);
//!
//!     init_logging(config).expect("Failed to initialize logging");
//!     tracing::info!(worker_count = 3, "Job manager starting");
//! }
//! ```
//!
//! ## LoggerSink integration
//!
//! When a sink is configured, every event that survives filtering is mirrored
//! to it as a [`LogEntry`](bridge_traits::time::LogEntry). Fields whose name
//! looks like a credential (`token`, `access_token`, …) are replaced with
//! `[REDACTED]` on the way out when `redact_pii` is set.

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::format::FmtSpan,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer, Registry,
};

/// Output format for log lines written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable output for development.
    Pretty,
    /// One JSON object per line for log shippers.
    Json,
    /// Single-line human readable output.
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration.
#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level applied to the engine's own crates when no custom filter is set.
    pub level: LogLevel,
    pub redact_pii: bool,
    /// Full `EnvFilter` directive string; replaces the default crate list.
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Emit span open/close events and the span list in JSON output.
    pub enable_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            redact_pii: true,
            filter: None,
            logger_sink: None,
            enable_spans: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("redact_pii", &self.redact_pii)
            .field("filter", &self.filter)
            .field("has_logger_sink", &self.logger_sink.is_some())
            .field("enable_spans", &self.enable_spans)
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_pii_redaction(mut self, redact: bool) -> Self {
        self.redact_pii = redact;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.enable_spans = enable;
        self
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns [`Error::Config`] if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let fmt_layer = build_fmt_layer(&config);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(LoggerSinkLayer::new(
            config.logger_sink.clone(),
            config.redact_pii,
        ))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let filter_string = if let Some(custom_filter) = &config.filter {
        custom_filter.clone()
    } else if let Ok(from_env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        from_env
    } else {
        // Engine crates at the configured level, dependencies at warn
        let level = level_directive(config.level);
        let mut directives: Vec<String> = [
            "core_runtime",
            "core_library",
            "core_metadata",
            "core_sync",
            "core_service",
            "bridge_traits",
        ]
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect();
        directives.push("sqlx=warn".to_string());
        directives.join(",")
    };

    EnvFilter::try_new(filter_string)
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
}

fn build_fmt_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.enable_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_writer(io::stdout)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(config.enable_spans)
            .with_span_list(config.enable_spans)
            .with_writer(io::stdout)
            .boxed(),
        // Job ids and owners already travel as fields
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(io::stdout)
            .boxed(),
    }
}

// ============================================================================
// LoggerSink forwarding
// ============================================================================

struct LoggerSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl LoggerSinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }
}

impl<S> Layer<S> for LoggerSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        let level = tracing_level_to_log_level(*metadata.level());

        if level < sink.min_level() {
            return;
        }

        let mut visitor = SinkVisitor::new(self.redact);
        event.record(&mut visitor);

        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());

        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (key, value) in visitor.fields {
            entry = entry.with_field(key, value);
        }

        if let Some(span) = ctx.lookup_current() {
            entry.span_id = Some(span.name().to_string());
        }

        let sink = Arc::clone(sink);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = sink.log(entry).await {
                        eprintln!("LoggerSink error: {}", err);
                    }
                });
            }
            Err(_) => {
                if let Err(err) = futures::executor::block_on(sink.log(entry)) {
                    eprintln!("LoggerSink error: {}", err);
                }
            }
        }
    }
}

struct SinkVisitor {
    redact: bool,
    message: Option<String>,
    fields: HashMap<String, String>,
}

impl SinkVisitor {
    fn new(redact: bool) -> Self {
        Self {
            redact,
            message: None,
            fields: HashMap::new(),
        }
    }

    fn record_value(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
            return;
        }

        let value = if self.redact {
            redact_if_sensitive(field.name(), &value)
        } else {
            value
        };
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for SinkVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }
}

fn tracing_level_to_log_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Redact a field value if its name marks it as a credential.
///
/// Library and metadata-service tokens are the only secrets the engine
/// handles; they must never reach a log line in clear text.
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    const SENSITIVE_FIELDS: &[&str] = &[
        "token",
        "password",
        "secret",
        "api_key",
        "authorization",
        "bearer",
        "credential",
    ];

    let name = field_name.to_ascii_lowercase();
    if SENSITIVE_FIELDS.iter().any(|marker| name.contains(marker)) {
        return "[REDACTED]".to_string();
    }
    // Connection URIs may carry a token as a query parameter
    if name.contains("uri") || name.contains("url") {
        return strip_query(value).to_string();
    }
    value.to_string()
}

/// Strip query parameters from a server URI before logging it.
///
/// Media-server URIs sometimes carry the access token as a query parameter.
pub fn strip_query(uri: &str) -> &str {
    uri.split_once('?').map(|(base, _)| base).unwrap_or(uri)
}
