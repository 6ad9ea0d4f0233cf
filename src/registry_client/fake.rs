//! In-memory `RegistryClient` double: swaps a trait-object collaborator
//! for a plain struct in tests instead of mocking the HTTP layer.

use crate::errors::RegistryError;
use crate::registry_client::{ImageDetails, ImageIndex, ImageReference, ManifestDescriptor, Platform, RegistryClient, RegistryClientFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeRegistryClient {
    repositories: Vec<String>,
    tags: HashMap<String, Vec<String>>,
    indexes: HashMap<(String, String), ImageIndex>,
    details: Mutex<HashMap<(String, String, Option<String>), ImageDetails>>,
}

impl FakeRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, repository: impl Into<String>, tags: Vec<String>) -> Self {
        let repository = repository.into();
        self.repositories.push(repository.clone());
        self.tags.insert(repository, tags);
        self
    }

    pub fn with_single_platform_image(
        mut self,
        repository: &str,
        tag: &str,
        digest: &str,
        layers: Vec<String>,
        platform: Platform,
    ) -> Self {
        self.details.get_mut().unwrap().insert(
            (repository.to_string(), tag.to_string(), None),
            ImageDetails {
                digest: digest.to_string(),
                layers,
                history: vec![],
                platform,
            },
        );
        self
    }

    pub fn with_multi_platform_image(
        mut self,
        repository: &str,
        tag: &str,
        variants: Vec<(Platform, String, Vec<String>)>,
    ) -> Self {
        let manifests = variants
            .iter()
            .map(|(platform, digest, _)| ManifestDescriptor {
                digest: digest.clone(),
                platform: platform.clone(),
            })
            .collect();
        self.indexes
            .insert((repository.to_string(), tag.to_string()), ImageIndex { manifests });

        for (platform, digest, layers) in variants {
            self.details.get_mut().unwrap().insert(
                (repository.to_string(), tag.to_string(), Some(digest.clone())),
                ImageDetails {
                    digest,
                    layers,
                    history: vec![],
                    platform,
                },
            );
        }
        self
    }

    /// Adds a manifest entry to an already-indexed multi-platform image
    /// without registering details for it, so `get_image_details` fails
    /// for that one platform variant while its siblings still resolve.
    pub fn with_unresolvable_platform_manifest(mut self, repository: &str, tag: &str, platform: Platform, digest: &str) -> Self {
        self.indexes
            .entry((repository.to_string(), tag.to_string()))
            .or_insert_with(|| ImageIndex { manifests: vec![] })
            .manifests
            .push(ManifestDescriptor { digest: digest.to_string(), platform });
        self
    }
}

#[async_trait]
impl RegistryClient for FakeRegistryClient {
    async fn catalog(&self, _registry_uri: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.repositories.clone())
    }

    async fn list_repository_contents(&self, repository: &str) -> Result<Vec<ImageReference>, RegistryError> {
        Ok(self
            .tags
            .get(repository)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|tag| ImageReference {
                repository: repository.to_string(),
                tag,
            })
            .collect())
    }

    async fn get_image_index(&self, reference: &ImageReference) -> Result<ImageIndex, RegistryError> {
        self.indexes
            .get(&(reference.repository.clone(), reference.tag.clone()))
            .cloned()
            .ok_or_else(|| RegistryError::NotAnIndex(reference.tag.clone()))
    }

    async fn get_image_details(
        &self,
        reference: &ImageReference,
        platform: Option<&Platform>,
    ) -> Result<ImageDetails, RegistryError> {
        let key = (
            reference.repository.clone(),
            reference.tag.clone(),
            platform.map(|p| {
                self.indexes
                    .get(&(reference.repository.clone(), reference.tag.clone()))
                    .and_then(|idx| idx.manifests.iter().find(|m| &m.platform == p))
                    .map(|m| m.digest.clone())
                    .unwrap_or_default()
            }),
        );
        self.details
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::InvalidReference(format!("{}:{}", reference.repository, reference.tag)))
    }
}

/// Hands back the same preconfigured client regardless of the snapshot —
/// seed-scenario tests fix the registry topology up front.
pub struct FakeRegistryClientFactory(pub Arc<FakeRegistryClient>);

impl RegistryClientFactory for FakeRegistryClientFactory {
    fn build(&self, _spec: &crate::crd::RegistrySpec, _basic_auth: Option<(String, String)>) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        Ok(self.0.clone())
    }
}
