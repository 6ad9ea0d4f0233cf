//! Scan handler: stage 3. Invokes the external scanner on an
//! SBOM and, on the Image's first scan, advances the job's counters.

use crate::bus::BusMessage;
use crate::crd::scan_job::CONDITION_COMPLETE;
use crate::crd::{owner_reference, VulnerabilityReport, VulnerabilityReportSpec};
use crate::errors::HandlerError;
use crate::handlers::{fetch_optional, HandlerContext};
use crate::messages::ResourceRef;
use crate::state_machine;
use crate::store::retry_on_conflict;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn handle(
    ctx: &HandlerContext,
    scan_job_ref: &ResourceRef,
    sbom_ref: &ResourceRef,
    message: &dyn BusMessage,
    cancel: CancellationToken,
) -> Result<(), HandlerError> {
    let Some(sbom) = fetch_optional(ctx.sboms.as_ref(), sbom_ref).await? else {
        debug!(sbom = %sbom_ref.name, "sbom deleted before scan handler ran");
        return Ok(());
    };

    let sarif = ctx.scan_tool.scan(&sbom.spec.spdx, &ctx.work_dir, cancel).await?;
    message.in_progress().await?;

    // shared-resource policy: the VulnerabilityReport create is the
    // single point of effect for the counter. `Store::create` reports
    // whether *this* call performed the insert, as a single atomic
    // operation against the store — unlike a separate existence check
    // followed by a conditional create, two overlapping deliveries of
    // this same stage-3 message can't both observe "absent" and both
    // go on to increment ScannedImagesCount; only the one that actually
    // wins the create may.
    let mut report = VulnerabilityReport::new(
        &sbom.name_any(),
        VulnerabilityReportSpec {
            image: sbom.spec.image.clone(),
            sarif,
        },
    );
    report.meta_mut().namespace = Some(sbom_ref.namespace.clone());
    report.meta_mut().owner_references = Some(vec![owner_reference(&sbom)]);
    let (_, created) = ctx.vulnerability_reports.create(&sbom_ref.namespace, &report).await?;
    if created {
        crate::metrics::record_scan_completed();
    }

    let Some(scan_job) = fetch_optional(ctx.scan_jobs.as_ref(), scan_job_ref).await? else {
        debug!(scan_job = %scan_job_ref.name, "scan job deleted before scan handler could record progress");
        return Ok(());
    };
    if scan_job.status.as_ref().map(|s| s.is_terminal()).unwrap_or(false) {
        return Ok(());
    }
    if !created {
        return Ok(());
    }

    let generation = scan_job.metadata.generation.unwrap_or_default();
    retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        if status.is_terminal() {
            return serde_json::to_value(&status).expect("ScanJobStatus always serializes");
        }
        status.scanned_images_count += 1;
        if status.images_count > 0 && status.scanned_images_count == status.images_count && !status.conditions.is_true(CONDITION_COMPLETE) {
            state_machine::mark_complete(&mut status, "AllImagesScanned", "all discovered images have been scanned", generation);
            crate::metrics::record_scan_job_terminal("complete");
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
    use crate::crd::image::Platform as ImagePlatform;
    use crate::crd::{ImageMetadataRef, Sbom, SbomSpec, ScanJob, ScanJobSpec, ScanJobStatus};
    use crate::registry_client::fake::{FakeRegistryClient, FakeRegistryClientFactory};
    use crate::state_machine::mark_scheduled;
    use crate::store::fake_store::FakeStore;
    use crate::tools::fake::{FakeScanTool, FakeSbomTool};
    use std::sync::Arc;

    struct NoopMessage;
    #[async_trait::async_trait]
    impl BusMessage for NoopMessage {
        fn subject(&self) -> &str {
            "sbom.scan"
        }
        fn payload(&self) -> &[u8] {
            b""
        }
        fn num_delivered(&self) -> u32 {
            1
        }
        async fn ack(&self) -> Result<(), crate::errors::BusError> {
            Ok(())
        }
        async fn nak(&self, _delay: std::time::Duration) -> Result<(), crate::errors::BusError> {
            Ok(())
        }
        async fn in_progress(&self) -> Result<(), crate::errors::BusError> {
            Ok(())
        }
    }

    fn image_meta() -> ImageMetadataRef {
        ImageMetadataRef {
            registry: "r.example/test".to_string(),
            repository: "app".to_string(),
            tag: "v1".to_string(),
            platform: ImagePlatform { os: "linux".to_string(), architecture: "amd64".to_string(), variant: None },
            digest: "sha256:aaa".to_string(),
        }
    }

    fn ctx() -> (Arc<FakeStore<ScanJob>>, Arc<FakeStore<Sbom>>, Arc<FakeStore<VulnerabilityReport>>, HandlerContext) {
        let scan_jobs = Arc::new(FakeStore::new());
        let sboms = Arc::new(FakeStore::new());
        let reports = Arc::new(FakeStore::new());
        let ctx = HandlerContext {
            scan_jobs: scan_jobs.clone(),
            images: Arc::new(FakeStore::new()),
            sboms: sboms.clone(),
            vulnerability_reports: reports.clone(),
            registries: Arc::new(FakeStore::new()),
            bus: Arc::new(FakeBus::new()),
            registry_client_factory: Arc::new(FakeRegistryClientFactory(Arc::new(FakeRegistryClient::new()))),
            sbom_tool: Arc::new(FakeSbomTool::new(b"x".to_vec())),
            scan_tool: Arc::new(FakeScanTool::new(b"sarif-bytes".to_vec())),
            max_status_retry_attempts: 5,
            work_dir: std::env::temp_dir(),
        };
        (scan_jobs, sboms, reports, ctx)
    }

    fn seeded_job(scan_jobs: &FakeStore<ScanJob>, images_count: u64, scanned: u64) {
        let mut job = ScanJob::new("j1", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = ScanJobStatus::default();
        mark_scheduled(&mut status, 1);
        status.images_count = images_count;
        status.scanned_images_count = scanned;
        job.status = Some(status);
        scan_jobs.seed("ns1", job);
    }

    #[tokio::test]
    async fn completes_job_when_last_image_scanned() {
        let (scan_jobs, sboms, reports, ctx) = ctx();
        seeded_job(&scan_jobs, 1, 0);

        let mut sbom = Sbom::new("img1", SbomSpec { image: image_meta(), spdx: b"spdx".to_vec(), format: "spdx-json".to_string() });
        sbom.meta_mut().namespace = Some("ns1".to_string());
        sboms.seed("ns1", sbom);

        handle(
            &ctx,
            &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() },
            &ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() },
            &NoopMessage,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = reports.get("ns1", "img1").await.unwrap();
        assert_eq!(report.spec.sarif, b"sarif-bytes");

        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        let status = job.status.unwrap();
        assert_eq!(status.scanned_images_count, 1);
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn stays_in_progress_until_all_images_scanned() {
        let (scan_jobs, sboms, _reports, ctx) = ctx();
        seeded_job(&scan_jobs, 2, 0);

        let mut sbom = Sbom::new("img1", SbomSpec { image: image_meta(), spdx: b"spdx".to_vec(), format: "spdx-json".to_string() });
        sbom.meta_mut().namespace = Some("ns1".to_string());
        sboms.seed("ns1", sbom);

        handle(
            &ctx,
            &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() },
            &ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() },
            &NoopMessage,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        let status = job.status.unwrap();
        assert_eq!(status.scanned_images_count, 1);
        assert!(!status.is_complete());
    }

    #[tokio::test]
    async fn redelivered_message_does_not_double_count() {
        let (scan_jobs, sboms, _reports, ctx) = ctx();
        seeded_job(&scan_jobs, 2, 0);

        let mut sbom = Sbom::new("img1", SbomSpec { image: image_meta(), spdx: b"spdx".to_vec(), format: "spdx-json".to_string() });
        sbom.meta_mut().namespace = Some("ns1".to_string());
        sboms.seed("ns1", sbom);

        let job_ref = ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() };
        let sbom_ref = ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() };

        handle(&ctx, &job_ref, &sbom_ref, &NoopMessage, CancellationToken::new()).await.unwrap();
        handle(&ctx, &job_ref, &sbom_ref, &NoopMessage, CancellationToken::new()).await.unwrap();

        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        assert_eq!(job.status.unwrap().scanned_images_count, 1);
    }

    #[tokio::test]
    async fn overlapping_concurrent_deliveries_do_not_double_count() {
        // Unlike `redelivered_message_does_not_double_count` above, these
        // two deliveries are in flight at the same time rather than one
        // after the other, exercising the actual race the shared-resource
        // policy guards against: both calls run the scan tool and reach
        // the VulnerabilityReport create before either has observed the
        // other's effect, so only the create's own return value (not a
        // pre-check) may gate the counter increment.
        let (scan_jobs, sboms, reports, ctx) = ctx();
        seeded_job(&scan_jobs, 2, 0);

        let mut sbom = Sbom::new("img1", SbomSpec { image: image_meta(), spdx: b"spdx".to_vec(), format: "spdx-json".to_string() });
        sbom.meta_mut().namespace = Some("ns1".to_string());
        sboms.seed("ns1", sbom);

        let job_ref = ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() };
        let sbom_ref = ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() };

        let (first, second) = tokio::join!(
            handle(&ctx, &job_ref, &sbom_ref, &NoopMessage, CancellationToken::new()),
            handle(&ctx, &job_ref, &sbom_ref, &NoopMessage, CancellationToken::new()),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(reports.list("ns1", &kube::api::ListParams::default()).await.unwrap().len(), 1);
        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        assert_eq!(job.status.unwrap().scanned_images_count, 1);
    }

    #[tokio::test]
    async fn missing_sbom_acks_and_stops() {
        let (scan_jobs, _sboms, reports, ctx) = ctx();
        seeded_job(&scan_jobs, 1, 0);

        handle(
            &ctx,
            &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() },
            &ResourceRef { name: "missing".to_string(), namespace: "ns1".to_string() },
            &NoopMessage,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(reports.list("ns1", &kube::api::ListParams::default()).await.unwrap().is_empty());
        let job = scan_jobs.get("ns1", "j1").await.unwrap();
        assert_eq!(job.status.unwrap().scanned_images_count, 0);
    }
}
