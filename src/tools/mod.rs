//! SBOM-generation and vulnerability-scan subprocess tools, invoked as
//! async child processes over `tokio::process::Command` since every
//! other I/O seam in this system is async.

pub mod fake;
pub mod subprocess;

use crate::errors::ToolError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait SbomTool: Send + Sync {
    /// Generates an SPDX document for `image_reference` (already pinned
    /// by digest step 4), returning the raw document bytes.
    /// `cache_dir` is the tool's persistent blob cache; `docker_config_dir`,
    /// when set, points at a transient docker-config directory scoped to
    /// this one call (the side channel is established for
    /// the subprocess only" and torn down by the caller on every exit path).
    async fn generate(&self, image_reference: &str, cache_dir: &Path, docker_config_dir: Option<&Path>, cancel: CancellationToken) -> Result<Vec<u8>, ToolError>;
}

#[async_trait]
pub trait ScanTool: Send + Sync {
    /// Scans an SPDX document for known vulnerabilities, returning a
    /// SARIF report's raw bytes. `cache_dir` is the tool's persistent
    /// vulnerability-database cache.
    async fn scan(&self, spdx: &[u8], cache_dir: &Path, cancel: CancellationToken) -> Result<Vec<u8>, ToolError>;
}
