use crate::errors::StoreError;
use crate::store::{to_patch, Store, StoreResource};
use async_trait::async_trait;
use kube::api::{Api, ListParams, PatchParams, PostParams};
use kube::Resource;
use std::marker::PhantomData;

/// A `Store<K>` backed by a real `kube::Api<K>`.
pub struct KubeStore<K> {
    client: kube::Client,
    _marker: PhantomData<K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: kube::Client) -> Self {
        KubeStore {
            client,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K: StoreResource> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(name.to_string()),
            other => StoreError::Kube(other),
        })
    }

    async fn list(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(params).await?.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<(K, bool), StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(created) => Ok((created, true)),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                let name = object.meta().name.clone().unwrap_or_default();
                let existing = api.get(&name).await.map_err(StoreError::from)?;
                Ok((existing, false))
            }
            Err(other) => Err(StoreError::Kube(other)),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(other) => Err(StoreError::Kube(other)),
        }
    }

    async fn patch_status(&self, namespace: &str, name: &str, status_patch: &serde_json::Value) -> Result<K, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Default::default(), &to_patch(status_patch))
            .await
            .map_err(StoreError::from)
    }

    async fn patch_metadata(&self, namespace: &str, name: &str, merge: &serde_json::Value) -> Result<K, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &kube::api::Patch::Merge(merge))
            .await
            .map_err(StoreError::from)
    }
}
