use std::sync::Arc;

use ahash::AHashMap;
use kiln_core::Resource;
use parking_lot::RwLock;
use tokio::sync::watch;

use super::{Change, ObjectRef};
use crate::watcher;

type Cache<K> = Arc<RwLock<AHashMap<ObjectRef, Arc<K>>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, `Restarted` events will clobber the state of other connected reflectors.
pub struct Writer<K> {
    store: Cache<K>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            store: Arc::default(),
            ready_tx,
            ready_rx,
        }
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// Applies a single watcher event to the store
    ///
    /// Returns what changed, with the previous version of updated objects. The first
    /// `Restarted` event marks the store as ready.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) -> Vec<Change<K>> {
        match event {
            watcher::Event::Applied(obj) => {
                let obj = Arc::new(obj.clone());
                let old = self.store.write().insert(ObjectRef::from_obj(&*obj), obj.clone());
                vec![Change::new(old, obj)]
            }
            watcher::Event::Deleted(obj) => {
                self.store.write().remove(&ObjectRef::from_obj(obj));
                vec![Change::Deleted(Arc::new(obj.clone()))]
            }
            watcher::Event::Restarted(new_objs) => {
                let new_objs = new_objs
                    .iter()
                    .map(|obj| (ObjectRef::from_obj(obj), Arc::new(obj.clone())))
                    .collect::<AHashMap<_, _>>();
                let mut store = self.store.write();
                let mut changes: Vec<Change<K>> = store
                    .iter()
                    .filter(|(key, _)| !new_objs.contains_key(*key))
                    .map(|(_, old)| Change::Deleted(old.clone()))
                    .collect();
                for (key, obj) in &new_objs {
                    changes.push(Change::new(store.get(key).cloned(), obj.clone()));
                }
                *store = new_objs;
                drop(store);
                self.ready_tx.send_replace(true);
                changes
            }
        }
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
pub struct Store<K> {
    store: Cache<K>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

/// The [`Writer`] was dropped before the store received its initial listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("writer dropped before the store became ready")]
pub struct WriterDropped;

impl<K: Resource> Store<K> {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// Falls back to a cluster scoped lookup when `key` carries a namespace.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let store = self.store.read();
        store
            .get(key)
            .or_else(|| {
                key.namespace.as_ref()?;
                store.get(&ObjectRef::new(&key.name))
            })
            .cloned()
    }

    /// Shorthand for a namespaced [`get`](Store::get)
    #[must_use]
    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get(&ObjectRef::new(name).within(namespace))
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Objects in `namespace` matching `predicate`
    #[must_use]
    pub fn list_namespaced(&self, namespace: &str, predicate: impl Fn(&K) -> bool) -> Vec<Arc<K>> {
        self.store
            .read()
            .iter()
            .filter(|(key, obj)| key.namespace.as_deref() == Some(namespace) && predicate(obj))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the initial listing has been received
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Waits for the initial listing
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        let mut rx = self.ready_rx.clone();
        rx.wait_for(|ready| *ready).await.map_err(|_| WriterDropped)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::{
        reflector::{Change, ObjectRef},
        watcher,
    };
    use futures::{poll, FutureExt};
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    fn cm(name: &str, ns: Option<&str>, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(String::from),
                resource_version: Some(rv.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn should_allow_getting_namespaced_object_by_namespaced_ref() {
        let cm = cm("obj", Some("ns"), "1");
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&cm)).as_deref(), Some(&cm));
        assert_eq!(store.get_namespaced("ns", "obj").as_deref(), Some(&cm));
        assert_eq!(store.get(&ObjectRef::new("obj")), None);
    }

    #[test]
    fn should_allow_getting_clusterscoped_object_by_namespaced_ref() {
        let cm = cm("obj", None, "1");
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::new("obj").within("ns")).as_deref(), Some(&cm));
    }

    #[test]
    fn applied_reports_previous_version() {
        let mut store_w = Writer::default();
        let changes = store_w.apply_watcher_event(&watcher::Event::Applied(cm("a", Some("ns"), "1")));
        assert!(matches!(&changes[..], [Change::Added(_)]));
        let changes = store_w.apply_watcher_event(&watcher::Event::Applied(cm("a", Some("ns"), "2")));
        match &changes[..] {
            [Change::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected changes {other:?}"),
        }
        let changes = store_w.apply_watcher_event(&watcher::Event::Deleted(cm("a", Some("ns"), "2")));
        assert!(matches!(&changes[..], [Change::Deleted(_)]));
        assert!(store_w.as_reader().is_empty());
    }

    #[test]
    fn restart_replaces_contents_and_reports_deletions() {
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm("gone", Some("ns"), "1")));
        store_w.apply_watcher_event(&watcher::Event::Applied(cm("kept", Some("ns"), "1")));
        let changes = store_w.apply_watcher_event(&watcher::Event::Restarted(vec![
            cm("kept", Some("ns"), "2"),
            cm("new", Some("ns"), "1"),
        ]));
        assert_eq!(changes.len(), 3);
        assert_eq!(changes.iter().filter(|c| matches!(c, Change::Deleted(_))).count(), 1);
        assert_eq!(changes.iter().filter(|c| matches!(c, Change::Updated { .. })).count(), 1);

        let store = store_w.as_reader();
        assert_eq!(store.len(), 2);
        assert_eq!(store.list_namespaced("ns", |c| c.metadata.name.as_deref() == Some("new")).len(), 1);
        assert!(store.list_namespaced("other", |_| true).is_empty());
    }

    #[tokio::test]
    async fn ready_after_first_restart() {
        let mut store_w = Writer::<ConfigMap>::default();
        let store = store_w.as_reader();
        assert!(!store.is_ready());
        let mut wait = Box::pin(store.wait_until_ready());
        assert!(poll!(wait.as_mut()).is_pending());
        store_w.apply_watcher_event(&watcher::Event::Restarted(vec![]));
        assert_eq!(wait.now_or_never(), Some(Ok(())));
        assert!(store.is_ready());
    }
}
