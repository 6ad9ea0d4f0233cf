//! SBOM CRD. Owned by Image; name equals the Image name.

use crate::crd::image::{ImageSpec, Platform};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadataRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub platform: Platform,
    pub digest: String,
}

impl From<&ImageSpec> for ImageMetadataRef {
    fn from(spec: &ImageSpec) -> Self {
        ImageMetadataRef {
            registry: spec.registry.clone(),
            repository: spec.repository.clone(),
            tag: spec.tag.clone(),
            platform: spec.platform.clone(),
            digest: spec.digest.clone(),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(group = "sbombastic.rancher.io", version = "v1alpha1", kind = "Sbom", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct SbomSpec {
    pub image: ImageMetadataRef,
    /// SPDX-JSON bytes produced by the external SBOM tool.
    #[serde(with = "crate::crd::base64_bytes")]
    #[schemars(with = "String")]
    pub spdx: Vec<u8>,
    pub format: String,
}
