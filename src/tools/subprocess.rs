//! External SBOM/scan tool invocations, over `tokio::process::Command`.
//! Every other I/O seam in this system is async, so cancellation is
//! threaded through a `CancellationToken` rather than a killer channel.
//! Both tools write their result to a file rather than stdout, per their
//! CLI contract.

use crate::errors::ToolError;
use crate::tools::{ScanTool, SbomTool};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs `command` to completion, killing the child if `cancel` fires first.
async fn run_to_completion(mut command: Command, cancel: CancellationToken) -> Result<(), ToolError> {
    command.stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            child.kill().await.ok();
            return Err(ToolError::Cancelled);
        }
        status = child.wait() => status?,
    };

    if !status.success() {
        return Err(ToolError::ExitStatus(status));
    }
    Ok(())
}

async fn read_output_file(path: &Path) -> Result<Vec<u8>, ToolError> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.is_empty() {
        return Err(ToolError::EmptyArtifact);
    }
    Ok(bytes)
}

/// `sbom-tool image --cache-dir D --format spdx-json --output F <ref>`.
pub struct SubprocessSbomTool {
    binary: String,
}

impl SubprocessSbomTool {
    pub fn new(binary: impl Into<String>) -> Self {
        SubprocessSbomTool { binary: binary.into() }
    }
}

#[async_trait]
impl SbomTool for SubprocessSbomTool {
    async fn generate(&self, image_reference: &str, cache_dir: &Path, docker_config_dir: Option<&Path>, cancel: CancellationToken) -> Result<Vec<u8>, ToolError> {
        let output = tempfile::Builder::new().prefix("sbombastic-sbom-").suffix(".spdx.json").tempfile_in(cache_dir)?;
        let output_path = output.path().to_path_buf();

        let mut command = Command::new(&self.binary);
        command.arg("image");
        command.arg("--cache-dir").arg(cache_dir);
        command.args(["--format", "spdx-json"]);
        command.arg("--output").arg(&output_path);
        command.arg(image_reference);
        if let Some(dir) = docker_config_dir {
            command.env("DOCKER_CONFIG", dir);
        }

        run_to_completion(command, cancel).await?;
        read_output_file(&output_path).await
    }
}

/// `scan-tool sbom --cache-dir D --format sarif --output F <sbom-file>`.
pub struct SubprocessScanTool {
    binary: String,
}

impl SubprocessScanTool {
    pub fn new(binary: impl Into<String>) -> Self {
        SubprocessScanTool { binary: binary.into() }
    }
}

#[async_trait]
impl ScanTool for SubprocessScanTool {
    async fn scan(&self, spdx: &[u8], cache_dir: &Path, cancel: CancellationToken) -> Result<Vec<u8>, ToolError> {
        let input = tempfile::Builder::new().prefix("sbombastic-sbom-input-").suffix(".spdx.json").tempfile_in(cache_dir)?;
        tokio::fs::write(input.path(), spdx).await?;

        let output = tempfile::Builder::new().prefix("sbombastic-sarif-").suffix(".sarif.json").tempfile_in(cache_dir)?;
        let output_path = output.path().to_path_buf();

        let mut command = Command::new(&self.binary);
        command.arg("sbom");
        command.arg("--cache-dir").arg(cache_dir);
        command.args(["--format", "sarif"]);
        command.arg("--output").arg(&output_path);
        command.arg(input.path());

        run_to_completion(command, cancel).await?;
        read_output_file(&output_path).await
    }
}
