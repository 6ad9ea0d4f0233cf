//! Bus payload shapes shared between the reconcilers that publish and the
//! handlers that consume them.

use serde::{Deserialize, Serialize};

pub const SUBJECT_CATALOG_CREATE: &str = "catalog.create";
pub const SUBJECT_SBOM_GENERATE: &str = "sbom.generate";
pub const SUBJECT_SBOM_SCAN: &str = "sbom.scan";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BaseMessage {
    #[serde(rename = "scanjob")]
    pub scan_job: ResourceRef,
}

pub type CreateCatalogMessage = BaseMessage;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateSbomMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub image: ResourceRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanSbomMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub sbom: ResourceRef,
}
