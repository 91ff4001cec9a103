//! API-key authentication for the public surface
//!
//! Keys are accepted from any of the header/query carriers the two client
//! ecosystems use. The `key` query parameter is stripped before the request
//! is forwarded so the relay never sees client credentials.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Check the request against the server-side allowlist.
pub(crate) fn authorize(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    allowed: &[String],
) -> bool {
    match candidate_keys(headers, query)
        .iter()
        .find(|key| allowed.iter().any(|a| a == *key))
    {
        Some(key) => {
            tracing::trace!("Authorized client {}", fingerprint(key));
            true
        }
        None => false,
    }
}

/// Collect every place a client may have put its key:
/// `x-goog-api-key`, `Authorization: Bearer`, `x-api-key`, `?key=`.
fn candidate_keys(headers: &HeaderMap, query: &HashMap<String, String>) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(v) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        keys.push(v.to_string());
    }
    if let Some(v) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        keys.push(v.trim().to_string());
    }
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        keys.push(v.to_string());
    }
    if let Some(v) = query.get("key") {
        keys.push(v.clone());
    }
    keys
}

/// Short fingerprint for logging (never log the actual key!)
pub(crate) fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn allow() -> Vec<String> {
        vec!["secret".to_string(), "other".to_string()]
    }

    #[test]
    fn test_accepts_each_carrier() {
        let empty_query = HashMap::new();

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("secret"));
        assert!(authorize(&headers, &empty_query, &allow()));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert!(authorize(&headers, &empty_query, &allow()));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("other"));
        assert!(authorize(&headers, &empty_query, &allow()));

        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("key".to_string(), "secret".to_string());
        assert!(authorize(&headers, &query, &allow()));
    }

    #[test]
    fn test_rejects_wrong_or_missing_key() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert!(!authorize(&headers, &query, &allow()));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("nope"));
        assert!(!authorize(&headers, &query, &allow()));
    }

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        let fp = fingerprint("secret");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint("secret"));
        assert_ne!(fp, fingerprint("other"));
    }
}
