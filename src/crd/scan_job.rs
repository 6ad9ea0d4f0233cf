//! ScanJob CRD. One attempt at a full registry scan.

use crate::crd::condition::Conditions;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known annotation holding the JSON-serialized Registry snapshot
/// taken at scheduling time. Workers read the registry
/// from here, never from the live object.
pub const REGISTRY_SNAPSHOT_ANNOTATION: &str = "sbombastic.rancher.io/registry-snapshot";

/// Stable creation-timestamp annotation used for history-limit ordering
/// instead of the server-assigned `metadata.creationTimestamp`,
/// which only has second precision on some API server versions and is set
/// by an admission defaulter with nanosecond precision in this design.
pub const STABLE_CREATION_TIME_ANNOTATION: &str = "sbombastic.rancher.io/created-at";

/// Set by the schedule runner so a ScanJob's origin is auditable.
pub const SCHEDULED_BY_ANNOTATION: &str = "sbombastic.rancher.io/scheduled-by";

pub const CONDITION_SCHEDULED: &str = "Scheduled";
pub const CONDITION_IN_PROGRESS: &str = "InProgress";
pub const CONDITION_COMPLETE: &str = "Complete";
pub const CONDITION_FAILED: &str = "Failed";

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sbombastic.rancher.io",
    version = "v1alpha1",
    kind = "ScanJob",
    namespaced,
    status = "ScanJobStatus",
    printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registry"}"#,
    printcolumn = r#"{"name":"Images", "type":"integer", "jsonPath":".status.imagesCount"}"#,
    printcolumn = r#"{"name":"Scanned", "type":"integer", "jsonPath":".status.scannedImagesCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobSpec {
    /// Immutable after creation (enforced by an external admission validator).
    pub registry: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub images_count: u64,
    #[serde(default)]
    pub scanned_images_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl ScanJobStatus {
    pub fn is_scheduled(&self) -> bool {
        self.conditions.is_true(CONDITION_SCHEDULED)
    }

    pub fn is_in_progress(&self) -> bool {
        self.conditions.is_true(CONDITION_IN_PROGRESS)
    }

    pub fn is_complete(&self) -> bool {
        self.conditions.is_true(CONDITION_COMPLETE)
    }

    pub fn is_failed(&self) -> bool {
        self.conditions.is_true(CONDITION_FAILED)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.is_failed()
    }

    /// A job is "Pending" exactly when it has not yet been scheduled and is
    /// not already terminal — the precondition checked before acting.
    pub fn is_pending(&self) -> bool {
        !self.is_scheduled() && !self.is_terminal()
    }
}
