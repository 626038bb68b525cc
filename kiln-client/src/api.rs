//! The typed object store interface
use async_trait::async_trait;

use crate::{Patch, Result};

/// Namespaced CRUD access to one resource type
///
/// Object safe so the controller can hold `Arc<dyn Api<K>>` for each type it writes.
#[async_trait]
pub trait Api<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Get a named object, bypassing any cache
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// Create an object, failing with `AlreadyExists` when the name is taken
    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete a named object
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Patch a named object and return the result
    async fn patch(&self, namespace: &str, name: &str, patch: &Patch) -> Result<K>;

    /// [`get`](Api::get), mapping a 404 to `None`
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Deletes, treating a missing object as success
pub async fn delete_ignore_missing<K>(api: &dyn Api<K>, namespace: &str, name: &str) -> Result<()>
where
    K: Send + Sync + 'static,
{
    match api.delete(namespace, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        res => res,
    }
}
