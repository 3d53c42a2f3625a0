//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, Layer, Registry};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[cfg(feature = "trace")]
    #[error("failed to install jaeger pipeline, {0}")]
    Jaeger(opentelemetry::trace::TraceError),
    #[cfg(feature = "tracker")]
    #[error("failed to parse sentry dsn, {0}")]
    SentryDsn(sentry::types::ParseDsnError),
}

// -----------------------------------------------------------------------------
// Guard structure

/// keeps alive the telemetry exporters until the program exits
#[derive(Default)]
pub struct Guard {
    #[cfg(feature = "tracker")]
    _sentry: Option<sentry::ClientInitGuard>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        #[cfg(feature = "trace")]
        opentelemetry::global::shutdown_tracer_provider();
    }
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg_attr(not(any(feature = "trace", feature = "tracker")), allow(unused_variables))]
pub fn initialize(config: &Configuration, verbosity: usize) -> Result<Guard, Error> {
    #[allow(unused_mut)]
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_filter(LevelFilter::from_level(level(verbosity)))
        .boxed()];

    #[cfg(feature = "trace")]
    if let Some(jaeger) = &config.jaeger {
        let tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .with_endpoint(jaeger.endpoint.to_owned())
            .install_batch(opentelemetry::runtime::Tokio)
            .map_err(Error::Jaeger)?;

        layers.push(
            tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_filter(LevelFilter::from_level(level(verbosity)))
                .boxed(),
        );
    }

    #[allow(unused_mut)]
    let mut guard = Guard::default();

    #[cfg(feature = "tracker")]
    if let Some(cfg) = &config.sentry {
        let dsn = cfg
            .dsn
            .parse::<sentry::types::Dsn>()
            .map_err(Error::SentryDsn)?;

        guard._sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        }));

        layers.push(sentry_tracing::layer().boxed());
    }

    tracing::subscriber::set_global_default(Registry::default().with(layers))
        .map_err(Error::GlobalDefaultSubscriber)?;

    Ok(guard)
}
