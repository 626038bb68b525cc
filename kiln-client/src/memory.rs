//! An in-process object store implementing [`Api`]
//!
//! Objects are kept as typed values and patched through their JSON form. Every call is
//! recorded, and failures can be queued per verb to exercise error paths.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kiln_core::ErrorResponse;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{Api, Error, Patch, Resource, Result};

/// The operation a [`Call`] performed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Delete,
    Patch,
}

/// One recorded api call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub namespace: String,
    pub name: String,
}

struct State<K> {
    objects: BTreeMap<(String, String), K>,
    calls: Vec<Call>,
    patches: Vec<Patch>,
    failures: HashMap<Verb, VecDeque<ErrorResponse>>,
    serial: u64,
}

impl<K> State<K> {
    fn record(&mut self, verb: Verb, namespace: &str, name: &str) -> Result<()> {
        self.calls.push(Call {
            verb,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        });
        match self.failures.get_mut(&verb).and_then(VecDeque::pop_front) {
            Some(err) => Err(Error::Api(err)),
            None => Ok(()),
        }
    }

    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }
}

/// Shared handle to an in-memory collection of one resource type
pub struct MemoryApi<K> {
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for MemoryApi<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<K> Default for MemoryApi<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                patches: Vec::new(),
                failures: HashMap::new(),
                serial: 0,
            })),
        }
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_owned(), name.to_owned())
}

impl<K> MemoryApi<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object as is, without recording a call
    pub fn insert(&self, obj: K) {
        let meta = obj.meta();
        let k = key(
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().objects.insert(k, obj);
    }

    /// Reads an object without recording a call
    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.state.lock().objects.get(&key(namespace, name)).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.state.lock().objects.values().cloned().collect()
    }

    /// Makes the next call of `verb` fail with `err`
    pub fn fail_next(&self, verb: Verb, err: ErrorResponse) {
        self.state.lock().failures.entry(verb).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, verb: Verb) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb)
            .cloned()
            .collect()
    }

    /// Every successfully applied patch, oldest first
    pub fn patches(&self) -> Vec<Patch> {
        self.state.lock().patches.clone()
    }
}

#[async_trait]
impl<K> Api<K> for MemoryApi<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let mut state = self.state.lock();
        state.record(Verb::Get, namespace, name)?;
        state
            .objects
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ErrorResponse::not_found(&K::plural(), name).into())
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let mut state = self.state.lock();
        let name = match obj.meta().name.clone() {
            Some(name) => name,
            None => {
                let prefix = obj.meta().generate_name.clone().unwrap_or_default();
                format!("{prefix}{:05}", state.next_serial())
            }
        };
        state.record(Verb::Create, namespace, &name)?;
        if state.objects.contains_key(&key(namespace, &name)) {
            return Err(ErrorResponse::already_exists(&K::plural(), &name).into());
        }

        let serial = state.next_serial();
        let meta = obj.meta_mut();
        meta.name = Some(name.clone());
        meta.namespace = Some(namespace.to_owned()).filter(|ns| !ns.is_empty());
        meta.uid.get_or_insert_with(|| format!("uid-{serial}"));
        meta.resource_version = Some(serial.to_string());
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        state.objects.insert(key(namespace, &name), obj.clone());
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(Verb::Delete, namespace, name)?;
        match state.objects.remove(&key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(ErrorResponse::not_found(&K::plural(), name).into()),
        }
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Patch) -> Result<K> {
        let mut state = self.state.lock();
        state.record(Verb::Patch, namespace, name)?;
        let current = state
            .objects
            .get(&key(namespace, name))
            .ok_or_else(|| Error::from(ErrorResponse::not_found(&K::plural(), name)))?;
        let mut doc = serde_json::to_value(current).map_err(Error::SerdeError)?;
        json_patch::merge(&mut doc, patch.value());
        let mut obj: K = serde_json::from_value(doc).map_err(Error::SerdeError)?;
        obj.meta_mut().resource_version = Some(state.next_serial().to_string());
        state.objects.insert(key(namespace, name), obj.clone());
        state.patches.push(patch.clone());
        Ok(obj)
    }
}
