//! Unit tests for sqlbridge error module

use sqlbridge::classify::{is_transient, is_transient_state, TRANSIENT_SQL_STATES};
use sqlbridge::error::{Error, ErrorCategory};

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("missing argument 'url'");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("missing argument"));
    assert!(!err.is_retriable());
}

#[test]
fn test_every_transient_state_is_retriable() {
    for state in TRANSIENT_SQL_STATES {
        let err = Error::driver(*state, "link gone");
        assert!(is_transient(&err), "{state} should be transient");
        assert_eq!(err.category(), ErrorCategory::TransientConnectivity);
        assert!(err.is_retriable());
    }
}

#[test]
fn test_transient_state_case_insensitive() {
    assert!(is_transient_state("08s01"));
    assert!(is_transient_state("hy010"));
}

#[test]
fn test_other_states_are_fatal() {
    for state in ["42S02", "23000", "22003", "08001", "40001", ""] {
        let err = Error::driver(state, "failure");
        assert!(!is_transient(&err), "{state} should be fatal");
        assert_eq!(err.category(), ErrorCategory::Query);
    }
}

#[test]
fn test_non_driver_errors_never_transient() {
    assert!(!is_transient(&Error::connection("refused")));
    assert!(!is_transient(&Error::NotConnected));
    assert!(!is_transient(&Error::timeout("deadline")));
    assert!(!is_transient(&Error::query("syntax error")));
}

#[test]
fn test_driver_error_display_includes_state() {
    let err = Error::driver("08S01", "communication link failure");
    assert_eq!(
        err.to_string(),
        "database error [08S01]: communication link failure"
    );
}

#[test]
fn test_into_query_error_keeps_detail() {
    let err = Error::driver("42S02", "invalid object name 'orders'").into_query_error("SELECT * FROM orders");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.sql_state(), Some("42S02"));
    assert!(err.to_string().contains("invalid object name"));
}

#[test]
fn test_retries_exhausted_is_connection_error() {
    let last = Error::driver("08S01", "link failure");
    let err = Error::retries_exhausted(3, last);

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("3 attempts"));
    let source = std::error::Error::source(&err).map(ToString::to_string);
    assert!(source.unwrap_or_default().contains("08S01"));
}

#[test]
fn test_not_connected() {
    let err = Error::NotConnected;
    assert_eq!(err.category(), ErrorCategory::NotConnected);
    assert!(err.to_string().contains("connect"));
}
