//! Request-line/header parsing and query-string decoding.

use std::collections::HashMap;

use thiserror::Error;

/// Hard cap on request-line + headers; larger requests are rejected with
/// 400 before any further parsing.
pub const MAX_REQUEST_HEADER_BYTES: usize = 8 * 1024;

/// Substrings that make a query string look like an injection attempt.
/// Checked against the raw (still percent-encoded) query string, case
/// insensitively, before any further processing.
const INJECTION_PATTERNS: &[&str] = &[
    "<script",
    ";drop",
    "../",
    "union select",
    "--",
    "/*",
    "*/",
    "xp_cmdshell",
    "<?php",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub raw_query: String,
}

/// HTTP-layer errors: request-parsing failures at the connection boundary,
/// named in the same style as `SensorError`/`TransportError`/`StorageError`/
/// `ConfigError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request line and headers exceeded {MAX_REQUEST_HEADER_BYTES} bytes")]
    TooLarge,
    #[error("malformed request line")]
    Malformed,
    #[error("query string matched a known injection pattern")]
    SuspiciousQuery,
}

/// Parse a raw HTTP/1.1 request-line + headers blob (headers are read but
/// not surfaced beyond validating total size; this server doesn't act on
/// any request header). `raw` must already have been capped at
/// [`MAX_REQUEST_HEADER_BYTES`] by the caller.
pub fn parse_request(raw: &str) -> Result<ParsedRequest, HttpError> {
    if raw.len() > MAX_REQUEST_HEADER_BYTES {
        return Err(HttpError::TooLarge);
    }
    let request_line = raw.lines().next().ok_or(HttpError::Malformed)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HttpError::Malformed)?.to_string();
    let target = parts.next().ok_or(HttpError::Malformed)?;
    let _version = parts.next().ok_or(HttpError::Malformed)?;

    let (path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    if contains_injection_pattern(&raw_query) {
        return Err(HttpError::SuspiciousQuery);
    }

    let query = parse_query_string(&raw_query);
    Ok(ParsedRequest {
        method,
        path,
        query,
        raw_query,
    })
}

fn contains_injection_pattern(raw_query: &str) -> bool {
    let decoded = urlencoding::decode(raw_query)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_query.to_string());
    let lowered = decoded.to_ascii_lowercase();
    INJECTION_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
}

/// Parse and percent-decode an `a=1&b=2` query string.
pub fn parse_query_string(raw_query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if raw_query.is_empty() {
        return params;
    }
    for pair in raw_query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = urlencoding::decode(key).map(|s| s.into_owned()).unwrap_or_default();
        let value = urlencoding::decode(value).map(|s| s.into_owned()).unwrap_or_default();
        params.insert(key, value);
    }
    params
}
