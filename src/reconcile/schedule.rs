//! Periodic schedule runner. A leader-elected loop that
//! creates a new ScanJob for any Registry whose scan interval has
//! elapsed since its last terminal ScanJob.
//!
//! Design note: this lists Registries fresh from the store on every tick
//! rather than threading a process-global cache through the runner — the
//! list call is cheap compared to the tick period (default one minute),
//! and a fresh list can never drift from what a watch-refreshed cache
//! would eventually converge to anyway.

use crate::crd::scan_job::SCHEDULED_BY_ANNOTATION;
use crate::crd::{ScanJob, ScanJobSpec};
use crate::errors::ReconcileError;
use crate::reconcile::{LeaderToken, ReconcilerContext};
use chrono::Utc;
use kube::api::ListParams;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SCHEDULER_ORIGIN: &str = "periodic-schedule-runner";

/// One tick over every Registry in `namespace`: create a ScanJob for any
/// registry whose interval has elapsed. Returns the number of ScanJobs
/// created, mainly so tests and logging can assert on tick activity.
pub async fn tick(ctx: &ReconcilerContext, namespace: &str) -> Result<usize, ReconcileError> {
    let registries = ctx.registries.list(namespace, &ListParams::default()).await?;
    let mut created = 0;

    for registry in registries {
        let Some(interval_secs) = registry.spec.scan_interval_seconds else {
            continue;
        };
        let name = registry.name_any();

        let mut jobs = ctx
            .scan_jobs
            .list(namespace, &ListParams::default())
            .await?
            .into_iter()
            .filter(|job| job.spec.registry == name)
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| job.meta().creation_timestamp.clone().map(|t| t.0));

        let due = match jobs.last() {
            None => true,
            Some(last) => match &last.status {
                Some(status) if status.is_terminal() => status
                    .completion_time
                    .map(|completed| Utc::now().signed_duration_since(completed).num_seconds() >= interval_secs as i64)
                    .unwrap_or(false),
                _ => false,
            },
        };

        if !due {
            continue;
        }

        let mut job = ScanJob::new(&generated_name(&name), ScanJobSpec { registry: name.clone() });
        job.meta_mut().namespace = Some(namespace.to_string());
        job.meta_mut().annotations = Some(std::collections::BTreeMap::from([(SCHEDULED_BY_ANNOTATION.to_string(), SCHEDULER_ORIGIN.to_string())]));

        match ctx.scan_jobs.create(namespace, &job).await {
            Ok((_, true)) => {
                info!(registry = %name, "scheduled periodic scan job");
                created += 1;
            }
            Ok((_, false)) => {
                debug!(registry = %name, "periodic scan job already existed, not counting as a new schedule");
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(created)
}

fn generated_name(registry_name: &str) -> String {
    // Deterministic within a tick, unique across ticks: a name collision
    // would only mean two ticks fired within the same second for the
    // same registry, which the interval loop below can't produce.
    let suffix = crate::string::cut(Utc::now().format("%Y%m%d%H%M%S").to_string(), 14);
    crate::string::cut(format!("{registry_name}-scan-{suffix}"), 63)
}

/// Runs [`tick`] on a fixed interval until `cancel` fires, skipping ticks
/// entirely while this process is not the elected leader (see
/// election ensures at most one creator").
pub async fn run(ctx: Arc<ReconcilerContext>, namespace: String, leader: Arc<dyn LeaderToken>, tick_interval: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if !leader.is_leader() {
            debug!("schedule runner tick skipped: not the leader");
            continue;
        }

        if let Err(err) = tick(&ctx, &namespace).await {
            warn!(error = %err, "schedule runner tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::crd::{CatalogType, Registry, RegistrySpec};
    use crate::state_machine;
    use crate::store::fake_store::FakeStore;
    use chrono::Duration as ChronoDuration;

    fn ctx() -> (Arc<FakeStore<ScanJob>>, Arc<FakeStore<Registry>>, ReconcilerContext) {
        let scan_jobs = Arc::new(FakeStore::new());
        let registries = Arc::new(FakeStore::new());
        let ctx = ReconcilerContext {
            scan_jobs: scan_jobs.clone(),
            registries: registries.clone(),
            images: Arc::new(FakeStore::new()),
            bus: Arc::new(FakeBus::new()),
            scan_job_history_limit: 10,
            max_status_retry_attempts: 5,
        };
        (scan_jobs, registries, ctx)
    }

    fn registry_with_interval(name: &str, seconds: u64) -> Registry {
        let mut r = Registry::new(
            name,
            RegistrySpec {
                uri: format!("r.example/{name}"),
                catalog_type: CatalogType::Catalog,
                repositories: vec![],
                auth_secret_ref: None,
                ca_bundle: None,
                insecure: false,
                scan_interval_seconds: Some(seconds),
            },
        );
        r.meta_mut().namespace = Some("ns1".to_string());
        r
    }

    #[tokio::test]
    async fn creates_a_job_when_none_exists_yet() {
        let (scan_jobs, registries, ctx) = ctx();
        registries.seed("ns1", registry_with_interval("reg1", 60));

        let created = tick(&ctx, "ns1").await.unwrap();
        assert_eq!(created, 1);
        assert_eq!(scan_jobs.list("ns1", &ListParams::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn does_not_create_when_last_job_still_in_progress() {
        let (scan_jobs, registries, ctx) = ctx();
        registries.seed("ns1", registry_with_interval("reg1", 60));
        let mut job = ScanJob::new("existing", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = crate::crd::ScanJobStatus::default();
        state_machine::initialize_conditions(&mut status, 1);
        state_machine::mark_scheduled(&mut status, 1);
        state_machine::mark_in_progress(&mut status, "CatalogCreationInProgress", "", 1);
        job.status = Some(status);
        scan_jobs.seed("ns1", job);

        let created = tick(&ctx, "ns1").await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn creates_when_interval_elapsed_since_last_completion() {
        let (scan_jobs, registries, ctx) = ctx();
        registries.seed("ns1", registry_with_interval("reg1", 60));
        let mut job = ScanJob::new("existing", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = crate::crd::ScanJobStatus::default();
        state_machine::initialize_conditions(&mut status, 1);
        state_machine::mark_scheduled(&mut status, 1);
        state_machine::mark_complete(&mut status, "AllImagesScanned", "", 1);
        status.completion_time = Some(Utc::now() - ChronoDuration::seconds(120));
        job.status = Some(status);
        scan_jobs.seed("ns1", job);

        let created = tick(&ctx, "ns1").await.unwrap();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn does_not_create_before_interval_elapses() {
        let (scan_jobs, registries, ctx) = ctx();
        registries.seed("ns1", registry_with_interval("reg1", 600));
        let mut job = ScanJob::new("existing", ScanJobSpec { registry: "reg1".to_string() });
        job.meta_mut().namespace = Some("ns1".to_string());
        let mut status = crate::crd::ScanJobStatus::default();
        state_machine::initialize_conditions(&mut status, 1);
        state_machine::mark_scheduled(&mut status, 1);
        state_machine::mark_complete(&mut status, "AllImagesScanned", "", 1);
        status.completion_time = Some(Utc::now() - ChronoDuration::seconds(5));
        job.status = Some(status);
        scan_jobs.seed("ns1", job);

        let created = tick(&ctx, "ns1").await.unwrap();
        assert_eq!(created, 0);
        let _ = scan_jobs;
    }

    #[tokio::test]
    async fn registry_without_interval_is_never_scheduled() {
        let (_scan_jobs, registries, ctx) = ctx();
        let mut r = registry_with_interval("reg1", 60);
        r.spec.scan_interval_seconds = None;
        registries.seed("ns1", r);

        let created = tick(&ctx, "ns1").await.unwrap();
        assert_eq!(created, 0);
    }
}
