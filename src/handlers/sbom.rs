//! SBOM handler: stage 2. Invokes the external SBOM tool on
//! one discovered image and fans out stage-3 work.

use crate::bus::BusMessage;
use crate::crd::{owner_reference, ImageMetadataRef, Sbom, SbomSpec};
use crate::errors::HandlerError;
use crate::handlers::{decode_registry_snapshot, fetch_optional, resolve_basic_auth, write_transient_docker_config, HandlerContext};
use crate::messages::{ResourceRef, ScanSbomMessage, SUBJECT_SBOM_SCAN};
use crate::names::scan_sbom_message_id;
use crate::store::Store;
use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn handle(
    ctx: &HandlerContext,
    scan_job_ref: &ResourceRef,
    image_ref: &ResourceRef,
    secrets: &dyn Store<Secret>,
    message: &dyn BusMessage,
    cancel: CancellationToken,
) -> Result<(), HandlerError> {
    let Some(scan_job) = fetch_optional(ctx.scan_jobs.as_ref(), scan_job_ref).await? else {
        debug!(scan_job = %scan_job_ref.name, "scan job deleted before sbom handler ran");
        return Ok(());
    };
    let Some(image) = fetch_optional(ctx.images.as_ref(), image_ref).await? else {
        debug!(image = %image_ref.name, "image deleted before sbom handler ran (pruned by registry reconciler)");
        return Ok(());
    };

    let snapshot = decode_registry_snapshot(&scan_job)?;

    let basic_auth = match &snapshot.auth_secret_ref {
        Some(name) => secrets.get(&scan_job_ref.namespace, name).await.ok().as_ref().and_then(resolve_basic_auth),
        None => None,
    };
    // step 4: the docker-config side channel exists only for the
    // subprocess invocation below and is released when `_docker_config`
    // drops, on every exit path including the `?` early-returns.
    let _docker_config = basic_auth.as_ref().map(|auth| write_transient_docker_config(&ctx.work_dir, &snapshot.uri, auth)).transpose()?;
    let docker_config_dir = _docker_config.as_ref().map(|dir| dir.path());

    // Pinned by digest, never tag.
    let image_reference = format!("{}/{}@{}", snapshot.uri.trim_end_matches('/'), image.spec.repository, image.spec.digest);

    let spdx = ctx.sbom_tool.generate(&image_reference, &ctx.work_dir, docker_config_dir, cancel.clone()).await?;

    // Heartbeat here extends AckWait past the cost of the tool
    // invocation above, before the (cheap) write to the store.
    message.in_progress().await?;

    let mut sbom = Sbom::new(
        &image.name_any(),
        SbomSpec {
            image: ImageMetadataRef::from(&image.spec),
            spdx,
            format: "spdx-json".to_string(),
        },
    );
    sbom.meta_mut().namespace = Some(scan_job_ref.namespace.clone());
    sbom.meta_mut().owner_references = Some(vec![owner_reference(&image)]);
    let (_, created) = ctx.sboms.create(&scan_job_ref.namespace, &sbom).await?;
    if created {
        crate::metrics::record_sbom_generated();
    }

    let scan_job_uid = scan_job.uid().unwrap_or_default();
    let scan_message = ScanSbomMessage {
        base: crate::messages::BaseMessage { scan_job: scan_job_ref.clone() },
        sbom: ResourceRef { name: sbom.name_any(), namespace: scan_job_ref.namespace.clone() },
    };
    let payload = serde_json::to_vec(&scan_message).map_err(|e| HandlerError::MalformedPayload(e.to_string()))?;
    ctx.bus.publish(SUBJECT_SBOM_SCAN, &scan_sbom_message_id(&scan_job_uid, &image.name_any()), payload).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::crd::image::Platform as ImagePlatform;
    use crate::crd::scan_job::REGISTRY_SNAPSHOT_ANNOTATION;
    use crate::crd::{CatalogType, Image, ImageSpec, Registry, RegistrySpec, ScanJob, ScanJobSpec};
    use crate::registry_client::fake::{FakeRegistryClient, FakeRegistryClientFactory};
    use crate::store::fake_store::FakeStore;
    use crate::tools::fake::{FakeScanTool, FakeSbomTool};
    use std::sync::Arc;

    struct NoopMessage;
    #[async_trait::async_trait]
    impl BusMessage for NoopMessage {
        fn subject(&self) -> &str {
            "sbom.generate"
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

    fn snapshot() -> RegistrySpec {
        RegistrySpec {
            uri: "r.example/test".to_string(),
            catalog_type: CatalogType::Catalog,
            repositories: vec![],
            auth_secret_ref: None,
            ca_bundle: None,
            insecure: false,
            scan_interval_seconds: None,
        }
    }

    fn ctx_with(sbom_tool: FakeSbomTool) -> (Arc<FakeStore<ScanJob>>, Arc<FakeStore<Image>>, Arc<FakeStore<crate::crd::Sbom>>, Arc<FakeBus>, HandlerContext) {
        let scan_jobs = Arc::new(FakeStore::new());
        let images = Arc::new(FakeStore::new());
        let sboms = Arc::new(FakeStore::new());
        let bus = Arc::new(FakeBus::new());
        let ctx = HandlerContext {
            scan_jobs: scan_jobs.clone(),
            images: images.clone(),
            sboms: sboms.clone(),
            vulnerability_reports: Arc::new(FakeStore::new()),
            registries: Arc::new(FakeStore::new()),
            bus: bus.clone(),
            registry_client_factory: Arc::new(FakeRegistryClientFactory(Arc::new(FakeRegistryClient::new()))),
            sbom_tool: Arc::new(sbom_tool),
            scan_tool: Arc::new(FakeScanTool::new(b"{}".to_vec())),
            max_status_retry_attempts: 5,
            work_dir: std::env::temp_dir(),
        };
        (scan_jobs, images, sboms, bus, ctx)
    }

    #[tokio::test]
    async fn creates_sbom_and_publishes_stage_three() {
        let (scan_jobs, images, sboms, bus, ctx) = ctx_with(FakeSbomTool::new(b"spdx-bytes".to_vec()));

        let mut job = ScanJob::new("j1", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        job.meta_mut().uid = Some("uid-1".to_string());
        job.meta_mut().annotations = Some(std::collections::BTreeMap::from([(
            REGISTRY_SNAPSHOT_ANNOTATION.to_string(),
            serde_json::to_string(&snapshot()).unwrap(),
        )]));
        scan_jobs.seed("ns1", job);

        let mut image = Image::new(
            "img1",
            ImageSpec {
                registry: "r.example/test".to_string(),
                repository: "app".to_string(),
                tag: "v1".to_string(),
                platform: ImagePlatform { os: "linux".to_string(), architecture: "amd64".to_string(), variant: None },
                digest: "sha256:aaa".to_string(),
                layers: vec![],
            },
        );
        image.meta_mut().namespace = Some("ns1".to_string());
        images.seed("ns1", image);

        let secrets: FakeStore<Secret> = FakeStore::new();
        handle(
            &ctx,
            &ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() },
            &ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() },
            &secrets,
            &NoopMessage,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let created = sboms.get("ns1", "img1").await.unwrap();
        assert_eq!(created.spec.spdx, b"spdx-bytes");
        assert_eq!(bus.published_count(SUBJECT_SBOM_SCAN), 1);
    }

    #[tokio::test]
    async fn missing_scan_job_acks_and_stops() {
        let (_scan_jobs, _images, sboms, bus, ctx) = ctx_with(FakeSbomTool::new(b"x".to_vec()));
        let secrets: FakeStore<Secret> = FakeStore::new();

        handle(
            &ctx,
            &ResourceRef { name: "missing".to_string(), namespace: "ns1".to_string() },
            &ResourceRef { name: "img1".to_string(), namespace: "ns1".to_string() },
            &secrets,
            &NoopMessage,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(bus.published_count(SUBJECT_SBOM_SCAN), 0);
        assert!(sboms.list("ns1", &kube::api::ListParams::default()).await.unwrap().is_empty());
    }
}
