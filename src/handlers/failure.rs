//! Failure handler: invoked by the bus dispatch loop once a
//! stage-1/2/3 message has exhausted its delivery attempts.

use crate::handlers::{fetch_optional, HandlerContext};
use crate::messages::ResourceRef;
use crate::state_machine;
use crate::store::retry_on_conflict;
use tracing::debug;

pub async fn handle(ctx: &HandlerContext, scan_job_ref: &ResourceRef, last_error: &str) -> Result<(), crate::errors::HandlerError> {
    let Some(scan_job) = fetch_optional(ctx.scan_jobs.as_ref(), scan_job_ref).await? else {
        debug!(scan_job = %scan_job_ref.name, "scan job deleted before failure handler ran");
        return Ok(());
    };
    if scan_job.status.as_ref().map(|s| s.is_terminal()).unwrap_or(false) {
        return Ok(());
    }

    let generation = scan_job.metadata.generation.unwrap_or_default();
    retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        if !status.is_terminal() {
            state_machine::mark_failed(&mut status, "InternalError", last_error, generation);
        }
        serde_json::to_value(&status).expect("ScanJobStatus always serializes")
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::crd::{ScanJob, ScanJobSpec, ScanJobStatus};
    use crate::registry_client::fake::{FakeRegistryClient, FakeRegistryClientFactory};
    use crate::state_machine::{initialize_conditions, mark_scheduled};
    use crate::store::fake_store::FakeStore;
    use crate::tools::fake::{FakeScanTool, FakeSbomTool};
    use std::sync::Arc;

    fn ctx() -> (Arc<FakeStore<ScanJob>>, HandlerContext) {
        let scan_jobs = Arc::new(FakeStore::new());
        let ctx = HandlerContext {
            scan_jobs: scan_jobs.clone(),
            images: Arc::new(FakeStore::new()),
            sboms: Arc::new(FakeStore::new()),
            vulnerability_reports: Arc::new(FakeStore::new()),
            registries: Arc::new(FakeStore::new()),
            bus: Arc::new(FakeBus::new()),
            registry_client_factory: Arc::new(FakeRegistryClientFactory(Arc::new(FakeRegistryClient::new()))),
            sbom_tool: Arc::new(FakeSbomTool::new(b"x".to_vec())),
            scan_tool: Arc::new(FakeScanTool::new(b"x".to_vec())),
            max_status_retry_attempts: 5,
            work_dir: std::env::temp_dir(),
        };
        (scan_jobs, ctx)
    }

    #[tokio::test]
    async fn marks_job_failed_with_last_error() {
        let (scan_jobs, ctx) = ctx();
        let mut job = ScanJob::new("j1", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = ScanJobStatus::default();
        initialize_conditions(&mut status, 1);
        mark_scheduled(&mut status, 1);
        job.status = Some(status);
        scan_jobs.seed("ns1", job);

        handle(&ctx, &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() }, "registry timed out 5 times")
            .await
            .unwrap();

        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        let status = job.status.unwrap();
        assert!(status.is_failed());
        assert_eq!(status.conditions.get("Failed").unwrap().message, "registry timed out 5 times");
    }

    #[tokio::test]
    async fn already_terminal_job_is_left_alone() {
        let (scan_jobs, ctx) = ctx();
        let mut job = ScanJob::new("j1", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = ScanJobStatus::default();
        initialize_conditions(&mut status, 1);
        state_machine::mark_complete(&mut status, "AllImagesScanned", "", 1);
        job.status = Some(status);
        scan_jobs.seed("ns1", job);

        handle(&ctx, &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() }, "late error")
            .await
            .unwrap();

        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        let status = job.status.unwrap();
        assert!(status.is_complete());
        assert!(!status.is_failed());
    }

    #[tokio::test]
    async fn missing_scan_job_is_not_an_error() {
        let (_scan_jobs, ctx) = ctx();
        handle(&ctx, &ResourceRef { name: "missing".to_string(), namespace: "ns1".to_string() }, "boom")
            .await
            .unwrap();
    }
}
