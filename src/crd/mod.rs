//! Custom resource definitions for the declarative store.
//! Declared with `kube::CustomResource` + `schemars`.

pub mod base64_bytes;
pub mod condition;
pub mod image;
pub mod registry;
pub mod sbom;
pub mod scan_job;
pub mod vulnerability_report;

pub use condition::{Condition, ConditionStatus, Conditions};
pub use image::{Image, ImageSpec, Platform};
pub use registry::{CatalogType, Registry, RegistrySpec, RegistryStatus};
pub use sbom::{ImageMetadataRef, Sbom, SbomSpec};
pub use scan_job::{ScanJob, ScanJobSpec, ScanJobStatus};
pub use vulnerability_report::{VulnerabilityReport, VulnerabilityReportSpec};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// A controller owner reference to `owner`, for cascading deletion (
/// ownership DAG: Registry ⇒ Image ⇒ SBOM ⇒ VulnerabilityReport).
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
