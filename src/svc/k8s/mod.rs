//! # Kubernetes module
//!
//! This module provide the reconciliation loop of custom resources and helpers
//! to interact with kubernetes

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, info_span, trace, Instrument, Span};

use crate::svc::{cfg::Configuration, provisioner::Registry};

pub mod client;
pub mod finalizer;
pub mod recorder;
pub mod resource;
pub mod secret;

// -----------------------------------------------------------------------------
// Constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "database_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'database_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "database_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'database_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "database_operator_reconciliation_event",
            "number of received event"
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'database_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "database_operator_reconciliation_duration",
            "duration of reconciliation"
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'database_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// shared by every reconciliation, it holds the kubernetes client, the
/// provisioning drivers and the configuration.
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub registry: Registry,
    pub config: Arc<Configuration>,
}

impl From<(kube::Client, Registry, Arc<Configuration>)> for Context {
    fn from((kube, registry, config): (kube::Client, Registry, Arc<Configuration>)) -> Self {
        Self {
            kube,
            registry,
            config,
        }
    }
}

impl Context {
    pub fn new(kube: kube::Client, registry: Registry, config: Arc<Configuration>) -> Self {
        Self::from((kube, registry, config))
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the span wrapping the reconciliation of a resource, every log line
/// emitted within carries its identity
pub fn span(kind: &str, namespace: &str, name: &str) -> Span {
    info_span!(
        "Reconciler::converge",
        kind = kind,
        namespace = namespace,
        name = name
    )
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, ctx: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the functions given to a kubernetes controller [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync + 'static;

    /// moves the object one step toward its desired state, deletion tells if
    /// the object is marked for removal
    async fn converge(ctx: Arc<Context>, obj: Arc<T>, deletion: bool) -> Result<(), Self::Error>;

    /// returns the [`Action`] to perform following the given error
    fn retry(_obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        let duration = ctx.config.operator.resync();

        trace!(
            duration = duration.as_secs(),
            error = err.to_string(),
            "Requeue failed reconciliation",
        );

        Action::requeue(duration)
    }

    /// process the object, it is requeued after the resync interval so that
    /// time based transitions are observed without any new event
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();
        let deletion = resource::deleted(&*obj);
        let event = if deletion {
            RECONCILIATION_DELETE_EVENT
        } else {
            RECONCILIATION_UPSERT_EVENT
        };

        info!(
            kind = &api_resource.kind,
            namespace = &namespace,
            name = &name,
            event = event,
            "Received event for custom resource",
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&api_resource.kind, &namespace, event])
            .inc();

        let result = Self::converge(ctx.to_owned(), obj.to_owned(), deletion)
            .instrument(span(&api_resource.kind, &namespace, &name))
            .await;

        if let Err(err) = result {
            error!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to reconcile custom resource",
            );

            return Err(err);
        }

        Ok(Action::requeue(ctx.config.operator.resync()))
    }
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of kubernetes custom
/// resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Default + Send + Sync,
    Self: Send + Sync + 'static,
{
    /// listen for events of the custom resource given as generic parameter
    async fn watch(&self, ctx: Arc<Context>) {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(ctx.to_owned())
            .run(Self::reconcile, Self::retry, ctx)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!(
                        kind = &api_resource.kind,
                        "We have reached the end of the infinite watch stream",
                    );
                    return;
                }
                Ok(Some((obj, _action))) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = ?obj.namespace,
                        name = &obj.name,
                        "Successfully reconcile custom resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj)) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = ?obj.namespace,
                        name = &obj.name,
                        "Received an event about an already deleted custom resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile custom resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(instant.elapsed().as_micros() as f64);
        }
    }
}

/// blanket implementation of [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Default + Send + Sync,
    U: ControllerBuilder<T> + Reconciler<T> + Send + Sync + 'static,
{
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::Registry;

    use super::*;

    #[test]
    fn span_carries_resource_identity() {
        tracing::subscriber::with_default(Registry::default(), || {
            let span = span("Database", "default", "shop");
            let metadata = span.metadata().unwrap();

            assert_eq!(metadata.name(), "Reconciler::converge");
            for field in ["kind", "namespace", "name"] {
                assert!(metadata.fields().field(field).is_some(), "{field}");
            }
        });
    }
}
