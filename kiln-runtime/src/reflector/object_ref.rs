use std::{
    fmt::{self, Display},
    str::FromStr,
};

use kiln_core::{Resource, ResourceExt};

/// A namespaced (if relevant) reference to an object in a [`Store`](super::Store)
///
/// Displays and parses as the `namespace/name` key used by work queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// The name of the object
    pub name: String,
    /// The namespace of the object, `None` for cluster scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            namespace: obj.meta().namespace.clone(),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Returned when a key has more than one `/` or an empty segment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key {0:?}")]
pub struct InvalidKey(String);

impl FromStr for ObjectRef {
    type Err = InvalidKey;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(ObjectRef::new(name)),
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(ObjectRef::new(name).within(ns))
            }
            _ => Err(InvalidKey(key.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        let r: ObjectRef = "app/ruby-1".parse().unwrap();
        assert_eq!(r, ObjectRef::new("ruby-1").within("app"));
        assert_eq!(r.to_string(), "app/ruby-1");

        let cluster: ObjectRef = "cluster".parse().unwrap();
        assert_eq!(cluster.namespace, None);
        assert_eq!(cluster.to_string(), "cluster");

        for bad in ["", "/a", "a/", "a/b/c"] {
            assert!(bad.parse::<ObjectRef>().is_err(), "{bad}");
        }
    }
}
