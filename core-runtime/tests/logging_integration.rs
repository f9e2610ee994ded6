//! Integration tests for logging bootstrap

use bridge_traits::time::LogLevel;
use core_runtime::logging::{
    init_logging, redact_if_sensitive, strip_query, LogFormat, LoggingConfig,
};
use core_runtime::Error;

#[test]
fn test_init_logging_only_once_per_process() {
    // The global subscriber can only be installed once per test binary, so
    // both the success and the failure path live in the same test.
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_filter("core_sync=warn");

    init_logging(config.clone()).expect("first initialization succeeds");

    let second = init_logging(config);
    assert!(matches!(second, Err(Error::Config(_))));
}

#[test]
fn test_invalid_filter_is_a_config_error() {
    let config = LoggingConfig::default().with_filter("core_sync=notalevel[");
    assert!(matches!(init_logging(config), Err(Error::Config(_))));
}

#[test]
fn test_tokens_never_reach_logs() {
    for field in ["token", "access_token", "server_token", "api_key", "password"] {
        assert_eq!(redact_if_sensitive(field, "value"), "[REDACTED]");
    }
}

#[test]
fn test_redaction_keeps_ordinary_fields() {
    assert_eq!(redact_if_sensitive("job_id", "b6f5"), "b6f5");
    assert_eq!(redact_if_sensitive("title", "Heat"), "Heat");
    assert_eq!(redact_if_sensitive("owner_id", "42"), "42");
}

#[test]
fn test_server_uri_query_is_stripped() {
    assert_eq!(
        strip_query("https://1-2-3-4.abc.media.example:32400/?token=xyz"),
        "https://1-2-3-4.abc.media.example:32400/"
    );
    assert_eq!(strip_query(""), "");
}

#[test]
fn test_default_config_redacts_and_keeps_spans() {
    let config = LoggingConfig::default();
    assert!(config.redact_pii);
    assert!(config.enable_spans);
    assert_eq!(config.level, LogLevel::Info);
    assert!(config.logger_sink.is_none());
}
