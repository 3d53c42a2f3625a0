//! # Metrics module
//!
//! This module provide a handler exporting metrics using the prometheus text
//! format

use hyper::{
    header::{self, HeaderValue},
    Body, Request, Response, StatusCode,
};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

/// returns the metrics gathered from the default registry
pub fn handler(_req: &Request<Body>) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];
    let mut res = Response::default();

    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        error!(error = err.to_string(), "Failed to encode metrics");

        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return res;
    }

    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        res.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);
    res
}
