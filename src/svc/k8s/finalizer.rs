//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer. A finalizer blocks the physical removal of a resource until the
//! controller that owns it removes the token.

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| f == finalizer))
        .unwrap_or(false)
}

/// add finalizer to the resource, it is a no-op if already present
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }

    obj
}

/// remove finalizer from the resource, other finalizers are kept in order
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    obj
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    const TOKEN: &str = "example.com/token";

    fn object(finalizers: Option<Vec<&str>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("object".into()),
                finalizers: finalizers.map(|f| f.into_iter().map(String::from).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_creates_list_when_absent() {
        let obj = add(object(None), TOKEN);

        assert!(contains(&obj, TOKEN));
        assert_eq!(obj.metadata.finalizers, Some(vec![TOKEN.to_string()]));
    }

    #[test]
    fn add_does_not_duplicate() {
        let obj = add(add(object(Some(vec!["other"])), TOKEN), TOKEN);

        assert_eq!(
            obj.metadata.finalizers,
            Some(vec!["other".to_string(), TOKEN.to_string()])
        );
    }

    #[test]
    fn remove_keeps_foreign_finalizers() {
        let obj = remove(object(Some(vec!["other", TOKEN])), TOKEN);

        assert!(!contains(&obj, TOKEN));
        assert_eq!(obj.metadata.finalizers, Some(vec!["other".to_string()]));
    }

    #[test]
    fn remove_on_missing_list_is_noop() {
        let obj = remove(object(None), TOKEN);

        assert!(!contains(&obj, TOKEN));
        assert_eq!(obj.metadata.finalizers, None);
    }
}
