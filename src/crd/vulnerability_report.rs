//! VulnerabilityReport CRD. Owned by Sbom; name equals the Sbom name.

use crate::crd::sbom::ImageMetadataRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sbombastic.rancher.io",
    version = "v1alpha1",
    kind = "VulnerabilityReport",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityReportSpec {
    pub image: ImageMetadataRef,
    /// SARIF bytes produced by the external scanner.
    #[serde(with = "crate::crd::base64_bytes")]
    #[schemars(with = "String")]
    pub sarif: Vec<u8>,
}
