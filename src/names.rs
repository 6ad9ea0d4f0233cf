//! Deterministic resource names and bus message ids.
//!
//! Image names are a hash of `registry/repo:tag@digest` so that retried
//! catalog runs converge on the same object instead of creating
//! duplicates. SBOM and VulnerabilityReport names equal
//! their owning Image/SBOM name by construction — callers just reuse the
//! Image name directly, there is no separate helper for that.

use sha2::{Digest, Sha256};

/// `sha256_hex("<registry>/<repo>:<tag>@<digest>")`, used as the Image
/// resource name.
pub fn image_name(registry_uri: &str, repository: &str, tag: &str, digest: &str) -> String {
    let key = format!("{registry_uri}/{repository}:{tag}@{digest}");
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn catalog_message_id(scan_job_uid: &str) -> String {
    format!("createCatalog/{scan_job_uid}")
}

pub fn generate_sbom_message_id(scan_job_uid: &str, image_name: &str) -> String {
    format!("generateSBOM/{scan_job_uid}/{image_name}")
}

pub fn scan_sbom_message_id(scan_job_uid: &str, image_name: &str) -> String {
    format!("scanSBOM/{scan_job_uid}/{image_name}")
}
