//! Responses produced by the gateway itself.
//!
//! # Responsibilities
//! - Map gateway failures to status codes and short, stable plaintext bodies
//! - Name the generator header values shared by the cache and the forwarder
//!
//! # Design Decisions
//! - Operators key dashboards off these statuses; bodies never carry request data
//! - Upstream failures result in 502 Bad Gateway, elapsed deadlines in 504 Gateway Timeout

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

pub const NOT_FOUND_BODY: &str = "404 page not found\n";
pub const TIMEOUT_BODY: &str = "bad gateway: connection timeout\n";
pub const BAD_GATEWAY_BODY: &str = "bad gateway: upstream unavailable\n";
pub const BODY_TOO_LARGE_BODY: &str = "bad request: request body too large\n";

/// Generator value for responses served from the cache.
pub const GENERATOR_CACHE: &str = "crauti/cache";
/// Generator value for responses served by an upstream.
pub const GENERATOR_UPSTREAM: &str = "crauti/upstream";

/// A plaintext response the way `http.Error` style servers write it.
pub fn plain(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

pub fn not_found() -> Response {
    plain(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

pub fn gateway_timeout() -> Response {
    plain(StatusCode::GATEWAY_TIMEOUT, TIMEOUT_BODY)
}

pub fn bad_gateway() -> Response {
    plain(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY)
}

pub fn body_too_large() -> Response {
    plain(StatusCode::BAD_REQUEST, BODY_TOO_LARGE_BODY)
}

/// Permanent redirect keeping the request method.
pub fn permanent_redirect(location: &str) -> Response {
    redirect(StatusCode::PERMANENT_REDIRECT, location)
}

/// Redirect used by the path table for subtree roots requested without a trailing slash.
pub fn moved_permanently(location: &str) -> Response {
    redirect(StatusCode::MOVED_PERMANENTLY, location)
}

fn redirect(status: StatusCode, location: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        // Locations are built from an already valid request line.
        Err(_) => plain(StatusCode::BAD_REQUEST, "bad request: invalid location\n"),
    }
}
