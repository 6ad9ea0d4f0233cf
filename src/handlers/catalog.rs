//! Catalog handler: stage 1. Walks a registry, reconciles the
//! Image set, and fans out stage-2 work.

use crate::crd::image::Platform as ImagePlatform;
use crate::crd::scan_job::CONDITION_IN_PROGRESS;
use crate::crd::{owner_reference, CatalogType, Image, ImageSpec};
use crate::diff::diff_image_sets;
use crate::errors::HandlerError;
use crate::handlers::{decode_registry_snapshot, fetch_optional, resolve_basic_auth, HandlerContext};
use crate::messages::{GenerateSbomMessage, ResourceRef, SUBJECT_SBOM_GENERATE};
use crate::names::{generate_sbom_message_id, image_name};
use crate::registry_client::{ImageReference, RegistryClient};
use crate::state_machine;
use crate::store::{retry_on_conflict, Store};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Resource, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn handle(ctx: &HandlerContext, scan_job_ref: &ResourceRef, secrets: &dyn Store<Secret>) -> Result<(), HandlerError> {
    let Some(scan_job) = fetch_optional(ctx.scan_jobs.as_ref(), scan_job_ref).await? else {
        debug!(scan_job = %scan_job_ref.name, "scan job deleted before catalog handler ran");
        return Ok(());
    };
    let generation = scan_job.metadata.generation.unwrap_or_default();

    retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        state_machine::mark_in_progress(&mut status, "CatalogCreationInProgress", "walking registry catalog", generation);
        serde_json::to_value(&status).expect("ScanJobStatus always serializes")
    })
    .await?;

    let snapshot = decode_registry_snapshot(&scan_job)?;

    let basic_auth = match &snapshot.auth_secret_ref {
        Some(name) => secrets
            .get(&scan_job_ref.namespace, name)
            .await
            .ok()
            .as_ref()
            .and_then(resolve_basic_auth),
        None => None,
    };
    let registry_client = ctx.registry_client_factory.build(&snapshot, basic_auth)?;

    // `NoCatalog` registries never support `_catalog`; the allow-list is
    // the only source of repositories for them (and non-empty, per
    // `RegistrySpec::validate`). Only a `Catalog` registry with an empty
    // allow-list actually calls out to `_catalog`.
    let repositories = if snapshot.catalog_type == CatalogType::NoCatalog || !snapshot.repositories.is_empty() {
        snapshot.repositories.clone()
    } else {
        registry_client.catalog(&snapshot.uri).await?
    };

    let discovered = discover_images(registry_client.as_ref(), &snapshot, &repositories).await;

    let registry_name = scan_job.spec.registry.clone();
    let existing_images = ctx.images.list(&scan_job_ref.namespace, &ListParams::default()).await?;
    // Images are keyed by the Registry's URI (`spec.registry`), matching
    // `build_image` below and the Registry reconciler — not by the
    // Registry's k8s object name, which is only used to fetch the owner.
    let existing: HashSet<String> = existing_images
        .iter()
        .filter(|image| image.spec.registry == snapshot.uri)
        .map(|image| image.name_any())
        .collect();
    let discovered_names: HashSet<String> = discovered.iter().map(|(_, name)| name.clone()).collect();

    let diff = diff_image_sets(&existing, &discovered_names);

    let owner = ctx.registries.get(&scan_job_ref.namespace, &registry_name).await.ok();

    for (spec, name) in &discovered {
        if !diff.to_create.contains(name) {
            continue;
        }
        // Re-check the job still exists before creating — a deleted job
        // must not leave orphaned Images behind.
        if fetch_optional::<crate::crd::ScanJob, _>(ctx.scan_jobs.as_ref(), scan_job_ref).await?.is_none() {
            debug!(scan_job = %scan_job_ref.name, "scan job deleted mid-catalog-run, stopping before further creates");
            return Ok(());
        }
        let mut image = Image::new(name, spec.clone());
        image.meta_mut().namespace = Some(scan_job_ref.namespace.clone());
        if let Some(registry) = &owner {
            image.meta_mut().owner_references = Some(vec![owner_reference(registry)]);
        }
        let (_, _created) = ctx.images.create(&scan_job_ref.namespace, &image).await?;
    }

    for obsolete_name in &diff.to_delete {
        if let Err(err) = ctx.images.delete(&scan_job_ref.namespace, obsolete_name).await {
            if !err.is_not_found() {
                return Err(err.into());
            }
        }
    }

    crate::metrics::record_catalog_run(diff.to_create.len(), diff.to_delete.len());

    let discovered_count = discovered.len() as u64;
    let scan_job_uid = scan_job.uid().unwrap_or_default();

    retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        if discovered_count == 0 {
            state_machine::mark_complete(&mut status, "NoImagesToScan", "registry has no matching images", generation);
        } else {
            state_machine::mark_in_progress(&mut status, "SBOMGenerationInProgress", "generating SBOMs", generation);
            status.images_count = discovered_count;
            status.scanned_images_count = 0;
        }
        serde_json::to_value(&status).expect("ScanJobStatus always serializes")
    })
    .await?;

    // One message per discovered image, whether newly created this run or
    // already present — the dedup window makes a redelivered catalog
    // message's republish a no-op, so there's no need to track which
    // images were actually just created.
    for (_, name) in &discovered {
        let message = GenerateSbomMessage {
            base: crate::messages::BaseMessage { scan_job: scan_job_ref.clone() },
            image: ResourceRef { name: name.clone(), namespace: scan_job_ref.namespace.clone() },
        };
        let payload = serde_json::to_vec(&message).map_err(|e| HandlerError::MalformedPayload(e.to_string()))?;
        let message_id = generate_sbom_message_id(&scan_job_uid, name);
        ctx.bus.publish(SUBJECT_SBOM_GENERATE, &message_id, payload).await?;
    }

    Ok(())
}

fn spec_image_name(spec: &ImageSpec) -> String {
    image_name(&spec.registry, &spec.repository, &spec.tag, &spec.digest)
}

async fn discover_images(
    client: &dyn RegistryClient,
    snapshot: &crate::crd::RegistrySpec,
    repositories: &[String],
) -> Vec<(ImageSpec, String)> {
    let mut out = Vec::new();
    for repository in repositories {
        let references = match client.list_repository_contents(repository).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(repository, error = %err, "failed to list repository contents, skipping");
                continue;
            }
        };

        for reference in references {
            match client.get_image_index(&reference).await {
                Ok(index) => {
                    for manifest in index.manifests {
                        match client
                            .get_image_details(&reference, Some(&manifest.platform))
                            .await
                        {
                            Ok(details) => out.push(build_image(snapshot, &reference, &details)),
                            Err(err) => warn!(repository, tag = %reference.tag, platform = ?manifest.platform, error = %err, "failed to fetch platform details, skipping"),
                        }
                    }
                }
                Err(_not_an_index) => match client.get_image_details(&reference, None).await {
                    Ok(details) => out.push(build_image(snapshot, &reference, &details)),
                    Err(err) => warn!(repository, tag = %reference.tag, error = %err, "failed to fetch image details, skipping"),
                },
            }
        }
    }
    out
}

fn build_image(snapshot: &crate::crd::RegistrySpec, reference: &ImageReference, details: &crate::registry_client::ImageDetails) -> (ImageSpec, String) {
    let platform = ImagePlatform {
        os: details.platform.os.clone(),
        architecture: details.platform.architecture.clone(),
        variant: details.platform.variant.clone(),
    };
    let spec = ImageSpec {
        registry: snapshot.uri.clone(),
        repository: reference.repository.clone(),
        tag: reference.tag.clone(),
        platform,
        digest: details.digest.clone(),
        layers: details.layers.clone(),
    };
    let name = spec_image_name(&spec);
    (spec, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::crd::scan_job::REGISTRY_SNAPSHOT_ANNOTATION;
    use crate::crd::{CatalogType, Registry, RegistrySpec, RegistryStatus, ScanJob, ScanJobSpec};
    use crate::registry_client::fake::{FakeRegistryClient, FakeRegistryClientFactory};
    use crate::registry_client::Platform as RcPlatform;
    use crate::store::fake_store::FakeStore;
    use crate::tools::fake::{FakeScanTool, FakeSbomTool};
    use kube::api::ListParams;
    use std::sync::Arc;

    fn snapshot() -> crate::crd::RegistrySpec {
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

    fn seed_job(scan_jobs: &FakeStore<ScanJob>) {
        seed_job_with_snapshot(scan_jobs, snapshot());
    }

    fn seed_job_with_snapshot(scan_jobs: &FakeStore<ScanJob>, snapshot: RegistrySpec) {
        let mut job = ScanJob::new("j1", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        job.meta_mut().uid = Some("uid-1".to_string());
        job.meta_mut().annotations = Some(std::collections::BTreeMap::from([(
            REGISTRY_SNAPSHOT_ANNOTATION.to_string(),
            serde_json::to_string(&snapshot).unwrap(),
        )]));
        scan_jobs.seed("ns1", job);
    }

    fn seed_registry(registries: &FakeStore<Registry>) {
        let mut registry = Registry::new("reg1", snapshot());
        registry.meta_mut().namespace = Some("ns1".to_string());
        registry.status = Some(RegistryStatus::default());
        registries.seed("ns1", registry);
    }

    struct Fixture {
        scan_jobs: Arc<FakeStore<ScanJob>>,
        images: Arc<FakeStore<Image>>,
        bus: Arc<FakeBus>,
        ctx: HandlerContext,
    }

    fn fixture(registry_client: FakeRegistryClient) -> Fixture {
        fixture_with_snapshot(registry_client, snapshot())
    }

    fn fixture_with_snapshot(registry_client: FakeRegistryClient, snapshot: RegistrySpec) -> Fixture {
        let scan_jobs = Arc::new(FakeStore::new());
        let images = Arc::new(FakeStore::new());
        let registries = Arc::new(FakeStore::new());
        let bus = Arc::new(FakeBus::new());
        seed_job_with_snapshot(&scan_jobs, snapshot);
        seed_registry(&registries);
        let ctx = HandlerContext {
            scan_jobs: scan_jobs.clone(),
            images: images.clone(),
            sboms: Arc::new(FakeStore::new()),
            vulnerability_reports: Arc::new(FakeStore::new()),
            registries,
            bus: bus.clone(),
            registry_client_factory: Arc::new(FakeRegistryClientFactory(Arc::new(registry_client))),
            sbom_tool: Arc::new(FakeSbomTool::new(b"x".to_vec())),
            scan_tool: Arc::new(FakeScanTool::new(b"x".to_vec())),
            max_status_retry_attempts: 5,
            work_dir: std::env::temp_dir(),
        };
        Fixture { scan_jobs, images, bus, ctx }
    }

    fn linux_amd64() -> RcPlatform {
        RcPlatform { os: "linux".to_string(), architecture: "amd64".to_string(), variant: None }
    }

    fn job_ref() -> ResourceRef {
        ResourceRef { name: "j1".to_string(), namespace: "ns1".to_string() }
    }

    #[tokio::test]
    async fn happy_path_single_platform_creates_image_and_publishes_stage_two() {
        let client = FakeRegistryClient::new()
            .with_repository("app", vec!["v1".to_string()])
            .with_single_platform_image("app", "v1", "sha256:aaa", vec![], linux_amd64());
        let fixture = fixture(client);
        let secrets: FakeStore<Secret> = FakeStore::new();

        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();

        let images = fixture.images.list("ns1", &ListParams::default()).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].spec.registry, "r.example/test");
        assert_eq!(fixture.bus.published_count(SUBJECT_SBOM_GENERATE), 1);

        let job = fixture.scan_jobs.get("ns1", "j1").await.unwrap();
        let status = job.status.unwrap();
        assert_eq!(status.images_count, 1);
        assert!(status.is_in_progress());
    }

    #[tokio::test]
    async fn one_failing_platform_does_not_block_the_others() {
        let good_platform = linux_amd64();
        let bad_platform = RcPlatform { os: "linux".to_string(), architecture: "arm64".to_string(), variant: None };
        let client = FakeRegistryClient::new()
            .with_repository("app", vec!["v1".to_string()])
            .with_multi_platform_image("app", "v1", vec![(good_platform, "sha256:aaa".to_string(), vec![])])
            .with_unresolvable_platform_manifest("app", "v1", bad_platform, "sha256:missing");
        let fixture = fixture(client);
        let secrets: FakeStore<Secret> = FakeStore::new();

        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();

        let images = fixture.images.list("ns1", &ListParams::default()).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(fixture.bus.published_count(SUBJECT_SBOM_GENERATE), 1);
    }

    #[tokio::test]
    async fn obsolete_images_for_the_same_registry_are_deleted() {
        let client = FakeRegistryClient::new();
        let fixture = fixture(client);
        let secrets: FakeStore<Secret> = FakeStore::new();

        let obsolete_spec = ImageSpec {
            registry: "r.example/test".to_string(),
            repository: "old".to_string(),
            tag: "v0".to_string(),
            platform: ImagePlatform { os: "linux".to_string(), architecture: "amd64".to_string(), variant: None },
            digest: "sha256:old".to_string(),
            layers: vec![],
        };
        let name = spec_image_name(&obsolete_spec);
        let mut image = Image::new(&name, obsolete_spec);
        image.meta_mut().namespace = Some("ns1".to_string());
        fixture.images.seed("ns1", image);

        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();

        let remaining = fixture.images.list("ns1", &ListParams::default()).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn redelivered_stage_one_message_does_not_duplicate_images_or_messages() {
        let client = FakeRegistryClient::new()
            .with_repository("app", vec!["v1".to_string()])
            .with_single_platform_image("app", "v1", "sha256:aaa", vec![], linux_amd64());
        let fixture = fixture(client);
        let secrets: FakeStore<Secret> = FakeStore::new();

        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();
        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();

        let images = fixture.images.list("ns1", &ListParams::default()).await.unwrap();
        assert_eq!(images.len(), 1);
        // Same scan-job uid + image name on both runs -> same message id ->
        // the bus's dedup window drops the second publish.
        assert_eq!(fixture.bus.published_count(SUBJECT_SBOM_GENERATE), 1);
    }

    #[tokio::test]
    async fn no_catalog_registry_never_calls_catalog_endpoint() {
        // `catalog()` on this client would discover an image under
        // "discoverable-via-catalog" if it were called at all. The
        // registry's allow-list only names "app", which this client has
        // no tags/details for, so a correct `NoCatalog` run discovers
        // nothing rather than falling back to `catalog()`.
        let client = FakeRegistryClient::new()
            .with_repository("discoverable-via-catalog", vec!["v1".to_string()])
            .with_single_platform_image("discoverable-via-catalog", "v1", "sha256:aaa", vec![], linux_amd64());
        let no_catalog_snapshot = RegistrySpec {
            uri: "r.example/test".to_string(),
            catalog_type: CatalogType::NoCatalog,
            repositories: vec!["app".to_string()],
            auth_secret_ref: None,
            ca_bundle: None,
            insecure: false,
            scan_interval_seconds: None,
        };
        let fixture = fixture_with_snapshot(client, no_catalog_snapshot);
        let secrets: FakeStore<Secret> = FakeStore::new();

        handle(&fixture.ctx, &job_ref(), &secrets).await.unwrap();

        let images = fixture.images.list("ns1", &ListParams::default()).await.unwrap();
        assert!(images.is_empty());
        let job = fixture.scan_jobs.get("ns1", "j1").await.unwrap();
        assert_eq!(job.status.unwrap().conditions.get("Complete").unwrap().reason, "NoImagesToScan");
    }
}
