use crate::errors::ToolError;
use crate::tools::{ScanTool, SbomTool};
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub struct FakeSbomTool {
    pub spdx: Vec<u8>,
}

impl FakeSbomTool {
    pub fn new(spdx: impl Into<Vec<u8>>) -> Self {
        FakeSbomTool { spdx: spdx.into() }
    }
}

#[async_trait]
impl SbomTool for FakeSbomTool {
    async fn generate(&self, _image_reference: &str, _cache_dir: &Path, _docker_config_dir: Option<&Path>, cancel: CancellationToken) -> Result<Vec<u8>, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        Ok(self.spdx.clone())
    }
}

pub struct FakeScanTool {
    pub sarif: Vec<u8>,
}

impl FakeScanTool {
    pub fn new(sarif: impl Into<Vec<u8>>) -> Self {
        FakeScanTool { sarif: sarif.into() }
    }
}

#[async_trait]
impl ScanTool for FakeScanTool {
    async fn scan(&self, _spdx: &[u8], _cache_dir: &Path, cancel: CancellationToken) -> Result<Vec<u8>, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        Ok(self.sarif.clone())
    }
}
