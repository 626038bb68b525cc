pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};

use std::{borrow::Cow, collections::BTreeMap};

/// An accessor trait for a persisted resource.
///
/// Every type the controller reads from a cache or writes through an api implements this,
/// either through `k8s_openapi` directly or through the local build, image and cluster types.
pub trait Resource {
    /// Returns kind of this object
    fn kind() -> Cow<'static, str>;
    /// Returns group of this object
    fn group() -> Cow<'static, str>;
    /// Returns version of this object
    fn version() -> Cow<'static, str>;
    /// Returns apiVersion of this object
    fn api_version() -> Cow<'static, str> {
        let group = Self::group();
        if group.is_empty() {
            return Self::version();
        }
        let mut group = group.into_owned();
        group.push('/');
        group.push_str(&Self::version());
        group.into()
    }
    /// Returns the plural name of the kind
    fn plural() -> Cow<'static, str>;

    /// Metadata that all persisted resources must have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted resources must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Generates an object reference for the resource
    fn object_ref(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            api_version: Some(Self::api_version().to_string()),
            kind: Some(Self::kind().to_string()),
            resource_version: meta.resource_version.clone(),
            ..Default::default()
        }
    }

    /// Generates a controller owner reference pointing to this resource
    ///
    /// Returns `None` until the object has been persisted and carries a uid.
    fn controller_owner_ref(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        Some(OwnerReference {
            api_version: Self::api_version().to_string(),
            kind: Self::kind().to_string(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            controller: Some(true),
            ..OwnerReference::default()
        })
    }
}

impl<K> Resource for K
where
    K: k8s_openapi::Metadata<Ty = ObjectMeta>,
{
    fn kind() -> Cow<'static, str> {
        K::KIND.into()
    }

    fn group() -> Cow<'static, str> {
        K::GROUP.into()
    }

    fn version() -> Cow<'static, str> {
        K::VERSION.into()
    }

    fn api_version() -> Cow<'static, str> {
        K::API_VERSION.into()
    }

    fn plural() -> Cow<'static, str> {
        K::URL_PATH_SEGMENT.into()
    }

    fn meta(&self) -> &ObjectMeta {
        self.metadata()
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        self.metadata_mut()
    }
}

static EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the name, or the generate name, or an empty string
    fn name_any(&self) -> String;
    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID of this incarnation of the object
    fn uid(&self) -> Option<String>;
    /// Returns the creation timestamp
    fn creation_timestamp(&self) -> Option<Time>;
    /// Returns resource labels
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Provides mutable access to the labels
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource annotations
    fn annotations(&self) -> &BTreeMap<String, String>;
    /// Provider mutable access to the annotations
    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource owner references
    fn owner_references(&self) -> &[OwnerReference];
    /// Whether a deletion timestamp has been set
    fn is_being_deleted(&self) -> bool;
    /// The `namespace/name` key used by caches and work queues
    fn key(&self) -> String;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta()
            .name
            .clone()
            .or_else(|| self.meta().generate_name.clone())
            .unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn creation_timestamp(&self) -> Option<Time> {
        self.meta().creation_timestamp.clone()
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        self.meta().labels.as_ref().unwrap_or(&EMPTY_MAP)
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().labels.get_or_insert_with(BTreeMap::new)
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        self.meta().annotations.as_ref().unwrap_or(&EMPTY_MAP)
    }

    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().annotations.get_or_insert_with(BTreeMap::new)
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn key(&self) -> String {
        match &self.meta().namespace {
            Some(ns) => format!("{ns}/{}", self.name_any()),
            None => self.name_any(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn keys_and_refs() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("ruby-1-build".into()),
                namespace: Some("app".into()),
                uid: Some("1234".into()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert_eq!(pod.key(), "app/ruby-1-build");
        assert_eq!(Pod::api_version(), "v1");
        let owner = pod.controller_owner_ref().unwrap();
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.uid, "1234");
        assert!(pod.labels().is_empty());
    }

    #[test]
    fn owner_ref_requires_uid() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("x".into()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert!(pod.controller_owner_ref().is_none());
    }
}
