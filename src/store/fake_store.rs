//! In-memory `Store<K>` double — a `HashMap`-backed stand-in for
//! `kube::Api` that swaps a trait-object collaborator for a plain
//! struct in tests rather than mocking the concrete client.

use crate::errors::StoreError;
use crate::store::{Store, StoreResource};
use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::Mutex;

pub struct FakeStore<K> {
    objects: Mutex<HashMap<(String, String), K>>,
    next_resource_version: Mutex<u64>,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        FakeStore {
            objects: Mutex::new(HashMap::new()),
            next_resource_version: Mutex::new(1),
        }
    }
}

impl<K: StoreResource> FakeStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, namespace: &str, object: K) {
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), object.name_any()), object);
    }

    fn next_version(&self) -> String {
        let mut version = self.next_resource_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }
}

#[async_trait]
impl<K: StoreResource> Store<K> for FakeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))
    }

    async fn list(&self, namespace: &str, _params: &ListParams) -> Result<Vec<K>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<(K, bool), StoreError> {
        // Single critical section: the existence check and the insert
        // happen under the same lock, so two overlapping callers can
        // never both observe "absent" and both win the create.
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), object.name_any());
        if let Some(existing) = objects.get(&key) {
            return Ok((existing.clone(), false));
        }
        let mut created = object.clone();
        created.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, created.clone());
        Ok((created, true))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.objects.lock().unwrap().remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status_patch: &serde_json::Value) -> Result<K, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;

        let to_kube_error = |e: serde_json::Error| StoreError::Kube(kube::Error::Service(Box::new(e)));

        let mut as_json = serde_json::to_value(current).map_err(to_kube_error)?;
        // Full-replace rather than a deep merge: good enough for the seed
        // scenarios, which always set the whole status in one call.
        if let Some(status_slot) = as_json.get_mut("status") {
            *status_slot = status_patch.clone();
        } else if let Some(object) = as_json.as_object_mut() {
            object.insert("status".to_string(), status_patch.clone());
        }

        let mut updated: K = serde_json::from_value(as_json).map_err(to_kube_error)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch_metadata(&self, namespace: &str, name: &str, merge: &serde_json::Value) -> Result<K, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;

        let to_kube_error = |e: serde_json::Error| StoreError::Kube(kube::Error::Service(Box::new(e)));
        let mut as_json = serde_json::to_value(current).map_err(to_kube_error)?;
        json_merge(&mut as_json, merge);

        let mut updated: K = serde_json::from_value(as_json).map_err(to_kube_error)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

/// `kube::api::Patch::Merge` semantics (RFC 7396 JSON Merge Patch),
/// applied in-process for the fake store: objects merge recursively,
/// every other value (including arrays) replaces wholesale.
fn json_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                json_merge(base_map.entry(key.clone()).or_insert(serde_json::Value::Null), patch_value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
