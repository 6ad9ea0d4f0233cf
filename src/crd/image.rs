//! Image CRD. One discovered (registry, repository, tag, platform,
//! digest) variant. Owned by Registry; name is a deterministic hash so
//! redelivered catalog runs converge on the same object.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// Canonical `os/architecture[/variant]` form used in digests and logs.
    pub fn as_str(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}/{}/{}", self.os, self.architecture, v),
            None => format!("{}/{}", self.os, self.architecture),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sbombastic.rancher.io",
    version = "v1alpha1",
    kind = "Image",
    namespaced,
    printcolumn = r#"{"name":"Repository", "type":"string", "jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Tag", "type":"string", "jsonPath":".spec.tag"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub platform: Platform,
    pub digest: String,
    pub layers: Vec<String>,
}
