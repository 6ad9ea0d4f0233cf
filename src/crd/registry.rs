//! Registry CRD. User-owned: a scan target plus auth/TLS material.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CatalogType {
    /// Registry supports the `_catalog` listing endpoint.
    Catalog,
    /// Registry does not; repositories must come from `repositories`.
    NoCatalog,
}

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sbombastic.rancher.io",
    version = "v1alpha1",
    kind = "Registry",
    namespaced,
    status = "RegistryStatus",
    printcolumn = r#"{"name":"Uri", "type":"string", "jsonPath":".spec.uri"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub uri: String,
    pub catalog_type: CatalogType,
    /// Repository allow-list. Empty means "all" when `catalog_type` is
    /// `Catalog`; MUST be non-empty when `catalog_type` is `NoCatalog`.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Name of a `kubernetes.io/dockerconfigjson` secret in the same
    /// namespace, read live (not snapshotted) so rotation is picked up.
    pub auth_secret_ref: Option<String>,
    /// PEM-encoded CA bundle for a private registry with a custom CA.
    pub ca_bundle: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Scan interval for the periodic schedule runner. `None` means
    /// the registry is only scanned on user-triggered ScanJobs.
    pub scan_interval_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub observed_generation: i64,
}

impl RegistrySpec {
    /// invariant: NoCatalog registries must declare repositories explicitly.
    pub fn validate(&self) -> Result<(), String> {
        if self.catalog_type == CatalogType::NoCatalog && self.repositories.is_empty() {
            return Err("repositories must be non-empty when catalogType is NoCatalog".to_string());
        }
        Ok(())
    }
}
