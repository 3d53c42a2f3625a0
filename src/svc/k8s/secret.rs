//! # Secret module
//!
//! This module provide helpers to resolve credentials from a reference to a
//! key of a kubernetes secret. Credentials are resolved on each call and never
//! cached, a rotated secret is picked up on the next reconciliation.

use std::string::FromUtf8Error;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::svc::{crd::database::SecretRef, provisioner::Credentials};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to find secret '{0}/{1}'")]
    NotFound(String, String),
    #[error("failed to find key '{2}' in secret '{0}/{1}'")]
    KeyNotFound(String, String, String),
    #[error("failed to decode key '{2}' of secret '{0}/{1}' as utf-8, {3}")]
    Utf8(String, String, String, FromUtf8Error),
    #[error("failed to retrieve secret '{0}/{1}', {2}")]
    Get(String, String, kube::Error),
}

// -----------------------------------------------------------------------------
// SecretStore trait

/// provides the raw value of a key of a secret
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn value(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, Error>;
}

#[async_trait]
impl SecretStore for Client {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn value(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, Error> {
        let api: Api<Secret> = Api::namespaced(self.to_owned(), namespace);

        debug!(
            kind = "Secret",
            namespace = namespace,
            name = name,
            "Execute a request to retrieve secret",
        );

        let secret = api
            .get_opt(name)
            .await
            .map_err(|err| Error::Get(namespace.to_string(), name.to_string(), err))?
            .ok_or_else(|| Error::NotFound(namespace.to_string(), name.to_string()))?;

        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|value| value.0)
            .ok_or_else(|| {
                Error::KeyNotFound(namespace.to_string(), name.to_string(), key.to_string())
            })
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the credentials of the given user, its password is read from the
/// referenced secret
pub async fn resolve(
    store: &dyn SecretStore,
    namespace: &str,
    user: &str,
    reference: &SecretRef,
) -> Result<Credentials, Error> {
    let SecretRef { name, key } = reference;
    let value = store.value(namespace, name, key).await?;
    let password = String::from_utf8(value).map_err(|err| {
        Error::Utf8(namespace.to_string(), name.to_string(), key.to_string(), err)
    })?;

    Ok(Credentials::new(user, password))
}
