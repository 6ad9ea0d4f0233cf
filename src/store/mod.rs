//! Declarative store abstraction (the Kubernetes-style API server backing
//! Registry/ScanJob/Image/Sbom/VulnerabilityReport). Wraps the usual
//! free functions (`kube_get_resources_by_selector`,
//! `kube_create_from_resource`, `kube_delete_all_from_selector`) into a
//! small generic trait so reconcilers/handlers can be tested against an
//! in-memory double instead of a real API server.

pub mod fake_store;
pub mod index;
pub mod kube_client;
pub mod kube_store;

use crate::errors::StoreError;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, Patch};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Bound shared by every custom resource this store operates on.
pub trait StoreResource:
    Resource<Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
where
    <Self as Resource>::DynamicType: Default,
{
}

impl<K> StoreResource for K
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
}

#[async_trait]
pub trait Store<K: StoreResource>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;
    async fn list(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>, StoreError>;

    /// Tolerates `AlreadyExists` by returning the existing object instead
    /// of an error — every create in this system is named deterministically
    /// and is meant to be idempotent under at-least-once delivery. The
    /// `bool` is `true` only when this call performed the insert; callers
    /// that must act exactly once per object (e.g. a counter increment)
    /// gate on it instead of on a separate existence check, since a
    /// pre-check-then-create is itself a race under overlapping redelivery.
    async fn create(&self, namespace: &str, object: &K) -> Result<(K, bool), StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Merge-patches `status` on the named object. Callers retry on a
    /// conflict by re-fetching and recomputing the patch; this method
    /// itself performs no retries.
    async fn patch_status(&self, namespace: &str, name: &str, status_patch: &serde_json::Value) -> Result<K, StoreError>;

    /// Merge-patches the object outside the status subresource (e.g. the
    /// registry-snapshot/stable-creation-time annotations written by C3,
    /// step 3.3). `merge` is the full patch body, not just a
    /// sub-field — callers pass e.g. `json!({"metadata": {"annotations": {...}}})`.
    async fn patch_metadata(&self, namespace: &str, name: &str, merge: &serde_json::Value) -> Result<K, StoreError>;
}

/// Retries `f` against a freshly re-fetched object up to `max_attempts`
/// times when the store reports an optimistic-concurrency conflict,
/// giving the status-subresource writers (C3/C4/...) a single place to
/// express "read-modify-write under resourceVersion contention".
pub async fn retry_on_conflict<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<K, StoreError>
where
    K: StoreResource,
    S: Store<K> + ?Sized,
    F: FnMut(&K) -> serde_json::Value,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(namespace, name).await?;
        let patch = mutate(&current);
        match store.patch_status(namespace, name, &patch).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Kube(kube::Error::Api(resp))) if resp.code == 409 => {
                if attempt >= max_attempts {
                    return Err(StoreError::ConflictRetriesExhausted(
                        format!("{}/{}", current.namespace().unwrap_or_default(), current.name_any()),
                        max_attempts,
                    ));
                }
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

/// Same retry-on-conflict shape as [`retry_on_conflict`], but for merge
/// patches outside the status subresource (C3's annotation writes,
/// step 3.3).
pub async fn retry_metadata_on_conflict<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<K, StoreError>
where
    K: StoreResource,
    S: Store<K> + ?Sized,
    F: FnMut(&K) -> serde_json::Value,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(namespace, name).await?;
        let patch = mutate(&current);
        match store.patch_metadata(namespace, name, &patch).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Kube(kube::Error::Api(resp))) if resp.code == 409 => {
                if attempt >= max_attempts {
                    return Err(StoreError::ConflictRetriesExhausted(
                        format!("{}/{}", current.namespace().unwrap_or_default(), current.name_any()),
                        max_attempts,
                    ));
                }
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

/// `Ok(None)` rather than an error when the object is missing — the
/// "ack-and-stop"/"fetch J, if not found stop" precondition shared by
/// every reconciler (C3, C9) and handler (C4-C7) entry point.
pub async fn fetch_optional<K, S>(store: &S, namespace: &str, name: &str) -> Result<Option<K>, StoreError>
where
    K: StoreResource,
    S: Store<K> + ?Sized,
{
    match store.get(namespace, name).await {
        Ok(object) => Ok(Some(object)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) fn to_patch(value: &serde_json::Value) -> Patch<serde_json::Value> {
    Patch::Merge(serde_json::json!({ "status": value }))
}
