//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_RESYNC: u64 = 10;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    /// namespace to watch, all namespaces are watched if not set
    #[serde(rename = "namespace", default)]
    pub namespace: Option<String>,
    /// period in seconds after which a resource is reconciled again
    #[serde(rename = "resync")]
    pub resync: u64,
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
}

impl Operator {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync)
    }
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Jaeger {
    #[serde(rename = "endpoint")]
    pub endpoint: String,
}

// -----------------------------------------------------------------------------
// Sentry structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Sentry {
    #[serde(rename = "dsn")]
    pub dsn: String,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "jaeger", default)]
    pub jaeger: Option<Jaeger>,
    #[serde(rename = "sentry", default)]
    pub sentry: Option<Sentry>,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = ConfigurationError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(File::from(path.to_owned()).required(true))
            .add_source(environment())
            .build()
            .map_err(|err| ConfigurationError::File(path, err))?
            .try_deserialize()
            .map_err(ConfigurationError::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, ConfigurationError> {
        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            paths.push(home.join(".config").join(env!("CARGO_PKG_NAME")).join("config"));
            paths.push(
                home.join(".local")
                    .join("share")
                    .join(env!("CARGO_PKG_NAME"))
                    .join("config"),
            );
        }

        paths.push(PathBuf::from("config"));

        paths
            .into_iter()
            .fold(defaults()?, |builder, path| {
                builder.add_source(File::from(path).required(false))
            })
            .add_source(environment())
            .build()
            .map_err(ConfigurationError::Cast)?
            .try_deserialize()
            .map_err(ConfigurationError::Cast)
    }

    /// log the loaded configuration, without sensitive values
    pub fn help(&self) {
        info!(
            namespace = self.operator.namespace.as_deref().unwrap_or("<all>"),
            resync = self.operator.resync,
            listen = self.operator.listen.to_string(),
            jaeger = self.jaeger.is_some(),
            sentry = self.sentry.is_some(),
            "Configuration loaded",
        );
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigurationError> {
    Config::builder()
        .set_default("operator.resync", DEFAULT_RESYNC as i64)
        .map_err(|err| ConfigurationError::Default("operator.resync".into(), err))?
        .set_default("operator.listen", DEFAULT_LISTEN)
        .map_err(|err| ConfigurationError::Default("operator.listen".into(), err))
}

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__")
}
