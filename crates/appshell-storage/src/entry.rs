//! Request keys and stored responses

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached request.
///
/// The method and the URL (path plus query, fragment removed) form the
/// storage key. Header-dependent identity is handled by the entry's
/// [`VaryRule`], the same way HTTP caches treat `Vary`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &str) -> Self {
        let url = match url.split_once('#') {
            Some((before, _)) => before,
            None => url,
        };
        let url = if url.starts_with('/') || url.contains("://") {
            url.to_string()
        } else {
            format!("/{}", url)
        };

        Self {
            method: method.to_ascii_uppercase(),
            url,
        }
    }

    /// Key for a plain GET of `url`
    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn to_string_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Hex SHA-256 of the string key, used for on-disk file names
    pub fn digest(&self) -> String {
        compute_sha256(self.to_string_key().as_bytes())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Request header values an entry was stored under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "headers")]
pub enum VaryRule {
    /// Header name (lowercase) and the request's value, if it sent one
    Headers(Vec<(String, Option<String>)>),
    /// `Vary: *`, never matches a later request
    Any,
}

impl Default for VaryRule {
    fn default() -> Self {
        VaryRule::Headers(Vec::new())
    }
}

impl VaryRule {
    /// Capture the request header values named by the response's `Vary` header
    pub fn capture(response_headers: &HeaderMap, request_headers: &HeaderMap) -> Self {
        let mut captured = Vec::new();

        for value in response_headers.get_all(http::header::VARY) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    return VaryRule::Any;
                }
                let name = name.to_ascii_lowercase();
                let request_value = request_headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                captured.push((name, request_value));
            }
        }

        captured.sort();
        captured.dedup();
        VaryRule::Headers(captured)
    }

    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        match self {
            VaryRule::Any => false,
            VaryRule::Headers(headers) => headers.iter().all(|(name, stored)| {
                let current = request_headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok());
                current == stored.as_deref()
            }),
        }
    }
}

/// Options for cache lookups
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Match on method and URL only, ignoring the entry's vary rule
    pub ignore_vary: bool,
}

/// An immutable response snapshot held in a cache generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Bytes,
    #[serde(default)]
    pub vary: VaryRule,
    pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(status: u16, status_text: impl Into<String>, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            body,
            vary: VaryRule::default(),
            stored_at: Utc::now(),
        }
    }

    pub fn with_vary(mut self, vary: VaryRule) -> Self {
        self.vary = vary;
        self
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn matches(&self, request_headers: &HeaderMap, options: MatchOptions) -> bool {
        options.ignore_vary || self.vary.matches(request_headers)
    }
}

/// Compute the hex SHA-256 of data
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_request_key_normalization() {
        let key = RequestKey::new("get", "index.html#top");
        assert_eq!(key.method, "GET");
        assert_eq!(key.url, "/index.html");
        assert_eq!(key.to_string_key(), "GET /index.html");

        // Query strings are part of the identity
        assert_ne!(RequestKey::get("/data.json?a=1"), RequestKey::get("/data.json"));
        assert_eq!(RequestKey::get("/a").digest(), RequestKey::new("GET", "/a").digest());
    }

    #[test]
    fn test_vary_capture_and_match() {
        let mut response = HeaderMap::new();
        response.insert(http::header::VARY, HeaderValue::from_static("Accept-Language, Accept"));

        let mut request = HeaderMap::new();
        request.insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("es"));

        let rule = VaryRule::capture(&response, &request);
        assert_eq!(
            rule,
            VaryRule::Headers(vec![
                ("accept".to_string(), None),
                ("accept-language".to_string(), Some("es".to_string())),
            ])
        );

        assert!(rule.matches(&request));

        let mut other = HeaderMap::new();
        other.insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        assert!(!rule.matches(&other));
    }

    #[test]
    fn test_vary_wildcard_never_matches() {
        let mut response = HeaderMap::new();
        response.insert(http::header::VARY, HeaderValue::from_static("*"));

        let rule = VaryRule::capture(&response, &HeaderMap::new());
        assert_eq!(rule, VaryRule::Any);
        assert!(!rule.matches(&HeaderMap::new()));

        let stored = StoredResponse::new(200, "OK", vec![], Bytes::new()).with_vary(rule);
        assert!(stored.matches(&HeaderMap::new(), MatchOptions { ignore_vary: true }));
    }

    #[test]
    fn test_size_counts_body_only() {
        let stored = StoredResponse::new(
            200,
            "OK",
            vec![("Content-Type".to_string(), "text/html".to_string())],
            Bytes::from_static(b"<html></html>"),
        );
        assert_eq!(stored.size(), 13);
    }
}
