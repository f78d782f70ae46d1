//! Response header inspection and rewriting.

use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};

/// Adds Accept-Encoding to the Vary header if not already present.
///
/// Every Vary occurrence is inspected, comma lists included, case-insensitively.
pub(crate) fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        HeaderValue::from_static("Accept-Encoding"),
    );
}

/// Rewrites the headers of a response that is about to be compressed.
pub(crate) fn set_compressed(headers: &mut HeaderMap, encoding: &HeaderValue) {
    headers.insert(header::CONTENT_ENCODING, encoding.clone());

    // Compressed size is unknown
    headers.remove(header::CONTENT_LENGTH);

    // Ranges over the identity representation do not apply to the encoded one
    headers.remove(header::ACCEPT_RANGES);

    add_vary_accept_encoding(headers);
}

/// Returns the declared Content-Length, if valid.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Checks if Content-Encoding header is already present.
pub(crate) fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .any(|v| !v.as_bytes().eq_ignore_ascii_case(b"identity"))
}

/// Checks if Content-Range header is present (range response).
pub(crate) fn has_content_range(headers: &HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

/// Returns true for responses that never carry a body.
pub(crate) fn is_bodyless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// Checks if the content type is already compressed media.
pub(crate) fn is_uncompressible_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = content_type(headers) else {
        return false;
    };

    // Skip all images except SVG
    if content_type.starts_with("image/") {
        return !content_type.starts_with("image/svg+xml");
    }

    // Skip gRPC except grpc-web
    if content_type.starts_with("application/grpc") {
        return !content_type.starts_with("application/grpc-web");
    }

    false
}

/// Checks if the response is a stream that must be flushed after every chunk.
pub(crate) fn is_streaming(headers: &HeaderMap) -> bool {
    let no_buffering = headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));

    no_buffering
        || content_type(headers).is_some_and(|ct| {
            ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
        })
}
