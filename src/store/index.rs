//! Field indices over the declarative store, built the way the
//! `kaniop` reconcile loop keeps its secret/statefulset stores: a
//! `kube::runtime::reflector` driven by a background watch, exposed to
//! reconcilers as a cheap, lock-free `Store<K>` reader.

use crate::crd::{Image, ScanJob};
use futures::TryStreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::warn;

/// A running reflector: `store` for reads, `handle` to cancel the
/// background watch on shutdown.
pub struct Reflected<K: kube::Resource + Clone + 'static> {
    pub store: Store<K>,
    pub handle: tokio::task::JoinHandle<()>,
}

fn spawn<K>(api: Api<K>) -> Reflected<K>
where
    K: kube::Resource + Clone + std::fmt::Debug + Send + Sync + serde::de::DeserializeOwned + 'static,
    K::DynamicType: Default + Clone + Eq + std::hash::Hash + Send + Sync,
{
    let writer = reflector::store::Writer::<K>::default();
    let store = writer.as_reader();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));

    let handle = tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(_event)) => continue,
                Ok(None) => break,
                Err(err) => warn!(error = %err, "reflector watch stream errored, continuing"),
            }
        }
    });

    Reflected { store, handle }
}

pub fn spawn_image_index(client: kube::Client, namespace: &str) -> Reflected<Image> {
    spawn(Api::namespaced(client, namespace))
}

pub fn spawn_scan_job_index(client: kube::Client, namespace: &str) -> Reflected<ScanJob> {
    spawn(Api::namespaced(client, namespace))
}

/// Images currently recorded for a registry, read straight off the
/// reflector cache rather than a live list call.
pub fn images_by_registry(store: &Store<Image>, registry: &str) -> Vec<Image> {
    store
        .state()
        .into_iter()
        .filter(|image| image.spec.registry == registry)
        .map(|arc| (*arc).clone())
        .collect()
}

pub fn scan_jobs_by_registry(store: &Store<ScanJob>, registry: &str) -> Vec<ScanJob> {
    store
        .state()
        .into_iter()
        .filter(|job| job.spec.registry == registry)
        .map(|arc| (*arc).clone())
        .collect()
}

pub fn scan_job_by_uid(store: &Store<ScanJob>, uid: &str) -> Option<ScanJob> {
    store
        .state()
        .into_iter()
        .find(|job| job.uid().as_deref() == Some(uid))
        .map(|arc| (*arc).clone())
}
