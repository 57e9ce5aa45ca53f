use tl_telemetry::logging::{self, LogFormat};

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init("test-service", "debug", LogFormat::Human);
    logging::init_logging("test-service", "info");

    tracing::info!(task_id = "t-1", step = "plan", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // The global subscriber may already be set by another test; this is then
    // a silent no-op.
    logging::init("test-service-json", "info", LogFormat::Json);

    tracing::info!(task_id = "t-2", "json log line");
}

#[test]
fn test_bad_default_level_does_not_panic() {
    let _ = logging::env_filter("this is [not a filter");
}

#[test]
fn test_default_format_is_human() {
    assert_eq!(LogFormat::default(), LogFormat::Human);
}
