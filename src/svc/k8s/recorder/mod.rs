//! # Event recorder module
//!
//! This module provide a way to publish kubernetes events about a custom
//! resource, each action applied on a resource is recorded this way.
//!
//! See following links for more details:
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go>
//! - <https://kubernetes.io/docs/reference/kubernetes-api/cluster-resources/event-v1/>

use std::fmt::{self, Debug, Display, Formatter};

use k8s_openapi::api::core::v1::Event;
use kube::{api::PostParams, Api, Client, CustomResourceExt, ResourceExt};
use tracing::debug;

pub mod event;

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// record an event for the given object
#[cfg_attr(feature = "trace", tracing::instrument(skip(client, obj)))]
pub async fn record<T, U>(
    client: Client,
    obj: &T,
    level: Level,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt,
    U: ToString + Debug,
{
    let namespace = obj.namespace().unwrap_or_default();

    debug!(
        namespace = &namespace,
        name = obj.name_any(),
        level = level.to_string(),
        action = action.to_string(),
        message = message,
        "Create event for custom resource",
    );

    Api::<Event>::namespaced(client, &namespace)
        .create(&PostParams::default(), &event::new(obj, level, action, message))
        .await
}

/// shortcut for the [`record`] function with the 'Normal' [`Level`]
pub async fn normal<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt,
    U: ToString + Debug,
{
    record(client, obj, Level::Normal, action, message).await
}

/// shortcut for the [`record`] function with the 'Warning' [`Level`]
pub async fn warning<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt,
    U: ToString + Debug,
{
    record(client, obj, Level::Warning, action, message).await
}
