//! # HTTP module
//!
//! This module provide the http server exposing the health and metrics
//! endpoints of the operator

use std::{convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::info;

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "database_operator_server_request",
            "number of request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'database_operator_server_request' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind on socket '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve on socket '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// Handlers

pub async fn router(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let begin = Instant::now();
    let res = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(&req),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler(&req),
        _ => not_found(&req),
    };

    info!(
        method = req.method().as_str(),
        path = req.uri().path(),
        status = res.status().as_u16(),
        duration = format!("{}us", begin.elapsed().as_micros()),
        "Request received",
    );

    #[cfg(feature = "metrics")]
    SERVER_REQUEST
        .with_label_values(&[
            req.method().as_str(),
            req.uri().path(),
            &res.status().as_u16().to_string(),
        ])
        .inc();

    Ok(res)
}

pub fn healthz(_req: &Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

pub fn not_found(_req: &Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

// -----------------------------------------------------------------------------
// Server

/// listen on the given address until the task is dropped
#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn serve(addr: SocketAddr) -> Result<(), Error> {
    let server = Server::try_bind(&addr)
        .map_err(|err| Error::Bind(addr, err))?
        .serve(make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(router))
        }));

    info!(addr = addr.to_string(), "Begin to listen on address");
    server.await.map_err(|err| Error::Serve(addr, err))
}
