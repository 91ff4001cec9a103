//! Configuration tests
//!
//! Parsing helpers are tested directly rather than through the environment,
//! which keeps the tests independent of process-global state.

use super::*;

#[test]
fn test_defaults_match_documentation() {
    let config = Config::default();
    assert_eq!(config.http_port, 7860);
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.ws_port, 9998);
    assert_eq!(config.streaming_mode, StreamingMode::Real);
    assert_eq!(config.failure_threshold, 3);
    assert_eq!(config.switch_on_uses, 40);
    assert_eq!(config.max_retries, 1);
    assert_eq!(config.retry_delay_ms, 2000);
    assert_eq!(
        config.immediate_switch_status_codes,
        [429, 503].into_iter().collect()
    );
    assert_eq!(config.api_keys, vec!["123456".to_string()]);
    assert_eq!(config.initial_auth_index, 1);
}

#[test]
fn test_streaming_mode_parse() {
    assert_eq!(StreamingMode::parse("real"), Some(StreamingMode::Real));
    assert_eq!(StreamingMode::parse("FAKE"), Some(StreamingMode::Fake));
    assert_eq!(StreamingMode::parse(" fake "), Some(StreamingMode::Fake));
    assert_eq!(StreamingMode::parse("pseudo"), None);
}

#[test]
fn test_status_code_list_parsing() {
    let default: HashSet<u16> = [429, 503].into_iter().collect();

    let parsed = parse_status_codes("429, 500,403", default.clone());
    assert_eq!(parsed, [429, 500, 403].into_iter().collect());

    // Bad entries are dropped, good ones kept
    let parsed = parse_status_codes("429,abc", default.clone());
    assert_eq!(parsed, [429].into_iter().collect());

    // Nothing parseable falls back to the default
    let parsed = parse_status_codes("abc,,", default.clone());
    assert_eq!(parsed, default);
}

#[test]
fn test_api_key_list_parsing() {
    assert_eq!(parse_api_keys("a,b , c"), vec!["a", "b", "c"]);
    assert_eq!(parse_api_keys("solo"), vec!["solo"]);
    assert!(parse_api_keys(",, ,").is_empty());
}

#[test]
fn test_bind_addresses() {
    let config = Config::default();
    assert_eq!(config.http_addr(), "0.0.0.0:7860");
    assert_eq!(config.ws_addr(), "0.0.0.0:9998");
}
