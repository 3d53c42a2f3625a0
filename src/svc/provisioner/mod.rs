//! # Provisioner module
//!
//! This module provide the capability to create and drop a database and its
//! user on a database server. Each supported server type is backed by a
//! [`Driver`] registered by name in a [`Registry`].

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use async_trait::async_trait;

pub mod mysql;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported database server type '{0}', available types are {1}")]
    Unsupported(String, String),
    #[error("failed to connect to database server '{0}', {1}")]
    Connect(String, sqlx::Error),
    #[error("failed to {0}, {1}")]
    Execute(&'static str, sqlx::Error),
    #[error("failed to {0}, server rejected the statement with code '{1}'")]
    Rejected(&'static str, String),
}

// -----------------------------------------------------------------------------
// Credentials structure

/// user and password pair, the password is never printed
#[derive(PartialEq, Eq, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U, P>(user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Endpoint structure

/// network address of a database server
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// -----------------------------------------------------------------------------
// Provisioner trait

/// create or drop a database and its user, every operation must be safe to
/// repeat after a partial failure
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_database(&self, name: &str, user: &Credentials) -> Result<(), Error>;

    async fn delete_database(&self, name: &str, user: &str) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// Driver trait

/// returns a [`Provisioner`] acting on the given server with the given
/// administrative credentials
pub trait Driver: Send + Sync {
    fn provisioner(&self, endpoint: Endpoint, root: Credentials) -> Box<dyn Provisioner>;
}

// -----------------------------------------------------------------------------
// Registry structure

/// drivers indexed by server type
#[derive(Clone)]
pub struct Registry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::empty().register(mysql::KIND, mysql::Driver)
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.drivers.keys()).finish()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            drivers: BTreeMap::new(),
        }
    }

    pub fn register<D>(mut self, kind: &str, driver: D) -> Self
    where
        D: Driver + 'static,
    {
        self.drivers.insert(kind.to_string(), Arc::new(driver));
        self
    }

    /// returns the driver of the given server type
    pub fn get(&self, kind: &str) -> Result<Arc<dyn Driver>, Error> {
        self.drivers.get(kind).cloned().ok_or_else(|| {
            Error::Unsupported(
                kind.to_string(),
                self.drivers
                    .keys()
                    .map(|k| format!("'{k}'"))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        })
    }
}
