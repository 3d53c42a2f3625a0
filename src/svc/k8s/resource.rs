//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::{api::core::v1::ObjectReference, NamespaceResourceScope};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource, cluster scoped
/// resources have an empty namespace.
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns if the error is a write rejected because the resource changed
/// since it was read
pub fn conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// returns a json merge patch carrying the resource version of the given
/// object, the api server rejects it with a conflict if the object changed in
/// the meantime
pub fn guarded<T>(obj: &T, mut patch: Value) -> Value
where
    T: Resource,
{
    if let Some(object) = patch.as_object_mut() {
        let metadata = object.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert(
                "resourceVersion".to_string(),
                json!(obj.meta().resource_version),
            );
        }
    }

    patch
}

/// make a guarded merge patch request on the given resource
pub async fn patch<T>(client: Client, obj: &T, patch: Value) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);
    let patch = guarded(obj, patch);

    debug!(
        namespace = &namespace,
        name = &name,
        patch = patch.to_string(),
        "Execute patch request on resource",
    );

    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

/// make a guarded merge patch request on the given resource's status
pub async fn patch_status<T>(client: Client, obj: &T, patch: Value) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);
    let patch = guarded(obj, patch);

    debug!(
        namespace = &namespace,
        name = &name,
        patch = patch.to_string(),
        "Execute patch request on resource's status",
    );

    Api::namespaced(client, &namespace)
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    ObjectReference {
        api_version: Some(api_resource.api_version),
        kind: Some(api_resource.kind),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        resource_version: obj.resource_version(),
        uid: obj.uid(),
        ..Default::default()
    }
}
