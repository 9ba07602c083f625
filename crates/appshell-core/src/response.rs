//! Conversions between network responses and cache snapshots, and the
//! synthesized fallback responses

use appshell_proxy::{Body, FetchResponse};
use appshell_storage::StoredResponse;
use bytes::Bytes;
use chrono::Utc;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, response::Parts};

/// Response header naming which fallback produced a response
pub const FALLBACK_HEADER: &str = "x-appshell-fallback";

/// Body of the synthesized 503
pub const UNAVAILABLE_BODY: &str = "Offline";

/// Snapshot a response for storage. `body` is the duplicated body.
///
/// The snapshot carries no vary rule; callers that answered a client
/// request attach one with [`VaryRule::capture`].
pub fn to_stored(parts: &Parts, body: Bytes) -> StoredResponse {
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    StoredResponse::new(
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or_default(),
        headers,
        body,
    )
}

/// Rebuild a response from a cache snapshot, with an `Age` header
/// counted from when it was stored
pub fn from_stored(stored: StoredResponse) -> FetchResponse {
    let age = (Utc::now() - stored.stored_at).num_seconds().max(0);

    let mut response = FetchResponse::new(Body::from(stored.body));
    *response.status_mut() = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for (name, value) in &stored.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(header::AGE, HeaderValue::from(age));

    response
}

/// 503 for a non-document request that could not reach the network
pub fn unavailable() -> FetchResponse {
    let mut response = FetchResponse::new(Body::from(UNAVAILABLE_BODY));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(FALLBACK_HEADER, HeaderValue::from_static("unavailable"));
    response
}

/// 502 for a request that was never intercepted and whose fetch failed
pub fn bad_gateway() -> FetchResponse {
    let mut response = FetchResponse::new(Body::from("Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Whether the request accepts an HTML document
pub fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("text/html"))
}
