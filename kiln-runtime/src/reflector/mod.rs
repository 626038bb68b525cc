//! Caches objects in memory

mod object_ref;
pub mod store;

use std::sync::Arc;

use futures::{stream, Stream, StreamExt};
use kiln_core::Resource;

pub use self::{
    object_ref::{InvalidKey, ObjectRef},
    store::{Store, Writer, WriterDropped},
};
use crate::watcher;

/// How one cached object changed
///
/// Carries the cached versions so event handlers can compare old and new state.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Change<K> {
    pub(crate) fn new(old: Option<Arc<K>>, new: Arc<K>) -> Self {
        match old {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        }
    }

    /// The latest known version of the object
    pub fn object(&self) -> &Arc<K> {
        match self {
            Change::Added(obj) | Change::Deleted(obj) | Change::Updated { new: obj, .. } => obj,
        }
    }
}

/// Cache objects from a watch event stream into a local [`Store`]
///
/// Every event is applied to `writer` before the resulting [`Change`]s are yielded, so a
/// consumer reading the store while handling a change sees at least that change.
///
/// The cache contains the last-seen state of objects,
/// which may lag slightly behind the actual state.
pub fn reflector<K, W>(mut writer: Writer<K>, stream: W) -> impl Stream<Item = Change<K>>
where
    K: Resource + Clone,
    W: Stream<Item = watcher::Event<K>>,
{
    stream.flat_map(move |event| stream::iter(writer.apply_watcher_event(&event)))
}

#[cfg(test)]
mod tests {
    use super::{reflector, Change, Writer};
    use crate::watcher;
    use futures::{stream, StreamExt};
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn reflector_applies_before_yielding() {
        let writer = Writer::default();
        let store = writer.as_reader();
        let events = stream::iter(vec![
            watcher::Event::Restarted(vec![cm("a")]),
            watcher::Event::Applied(cm("b")),
            watcher::Event::Deleted(cm("a")),
        ]);
        let mut changes = Box::pin(reflector(writer, events));

        let first = changes.next().await.unwrap();
        assert!(matches!(first, Change::Added(_)));
        assert!(store.is_ready());
        assert_eq!(store.len(), 1);

        let second = changes.next().await.unwrap();
        assert_eq!(second.object().metadata.name.as_deref(), Some("b"));
        assert_eq!(store.len(), 2);

        assert!(matches!(changes.next().await, Some(Change::Deleted(_))));
        assert!(changes.next().await.is_none());
        assert_eq!(store.len(), 1);
    }
}
