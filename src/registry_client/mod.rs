//! Container registry client (the catalog/list-tags/fetch-manifest
//! collaborator). Generalizes a `container_registry::docker`-style
//! manifest-parsing and retry idiom from blocking subprocess calls
//! (`docker manifest inspect`) to an async HTTP client talking the OCI
//! Distribution API directly.

pub mod fake;
pub mod oci;

use crate::errors::RegistryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A fully qualified reference: `repository:tag` within one registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDescriptor {
    pub digest: String,
    pub platform: Platform,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageIndex {
    pub manifests: Vec<ManifestDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDetails {
    pub digest: String,
    pub layers: Vec<String>,
    pub history: Vec<String>,
    pub platform: Platform,
}

/// Builds a `RegistryClient` from a Registry snapshot, so each handler
/// call can honor per-registry TLS/auth material without
/// the core depending on any one wire implementation.
pub trait RegistryClientFactory: Send + Sync {
    fn build(&self, spec: &crate::crd::RegistrySpec, basic_auth: Option<(String, String)>) -> Result<std::sync::Arc<dyn RegistryClient>, RegistryError>;
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// `GET /v2/_catalog`. Empty allow-list callers only — explicit
    /// allow-lists bypass this entirely.
    async fn catalog(&self, registry_uri: &str) -> Result<Vec<String>, RegistryError>;

    /// Tag references for one repository.
    async fn list_repository_contents(&self, repository: &str) -> Result<Vec<ImageReference>, RegistryError>;

    /// Fails with `RegistryError::NotAnIndex` if `reference` resolves to a
    /// single-platform manifest rather than a multi-platform index.
    async fn get_image_index(&self, reference: &ImageReference) -> Result<ImageIndex, RegistryError>;

    /// `platform` narrows a multi-platform pull to one variant; `None`
    /// means the reference is already single-platform.
    async fn get_image_details(
        &self,
        reference: &ImageReference,
        platform: Option<&Platform>,
    ) -> Result<ImageDetails, RegistryError>;
}
