//! ScanJob reconciler. Snapshots the referenced Registry,
//! enforces the per-registry history limit, publishes the stage-1
//! message, and marks the job Scheduled.

use crate::crd::scan_job::{REGISTRY_SNAPSHOT_ANNOTATION, STABLE_CREATION_TIME_ANNOTATION};
use crate::errors::ReconcileError;
use crate::messages::{BaseMessage, ResourceRef, SUBJECT_CATALOG_CREATE};
use crate::names::catalog_message_id;
use crate::reconcile::ReconcilerContext;
use crate::state_machine;
use crate::store::{fetch_optional, retry_metadata_on_conflict, retry_on_conflict};
use chrono::{DateTime, Utc};
use kube::api::ListParams;
use kube::ResourceExt;
use tracing::{debug, info};

/// The annotation's value when present, else the server-assigned
/// creation timestamp. step 3.1 calls for the annotation
/// specifically (set "by an admission defaulter with nanosecond
/// precision"); since that admission chain is out of scope, this
/// reconciler sets the annotation itself on first sight of a job,
/// immediately below, so every job it ever schedules has one.
fn stable_creation_time(job: &crate::crd::ScanJob) -> DateTime<Utc> {
    job.annotations()
        .get(STABLE_CREATION_TIME_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| job.meta().creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(Utc::now)
}

pub async fn reconcile(ctx: &ReconcilerContext, scan_job_ref: &ResourceRef) -> Result<(), ReconcileError> {
    let Some(scan_job) = fetch_optional(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name).await? else {
        debug!(scan_job = %scan_job_ref.name, "scan job deleted, nothing to reconcile");
        return Ok(());
    };
    if scan_job.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let generation = scan_job.metadata.generation.unwrap_or_default();
    let status = scan_job.status.clone().unwrap_or_default();

    // The watch has no generation filter: every write this reconciler
    // itself makes (annotations, status) re-triggers it. Once a
    // generation has been observed there is nothing left for this
    // reconciler to do until the next spec change, so skip before
    // touching the store again. `observed_generation` starts at 0
    // (`ScanJobStatus::default`), which never matches a real
    // generation (k8s generations start at 1), so a freshly-created,
    // still-pending job is never skipped here.
    if status.observed_generation != 0 && status.observed_generation == generation {
        debug!(scan_job = %scan_job_ref.name, generation, "generation already observed, skipping (reconcile triggered by our own write)");
        return Ok(());
    }

    // Admission is out of scope; guarantee the stable creation-time
    // annotation exists before it's used for history ordering below.
    if !scan_job.annotations().contains_key(STABLE_CREATION_TIME_ANNOTATION) {
        retry_metadata_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |_current: &crate::crd::ScanJob| {
            serde_json::json!({ "metadata": { "annotations": { STABLE_CREATION_TIME_ANNOTATION: Utc::now().to_rfc3339() } } })
        })
        .await?;
    }

    if !status.is_pending() {
        debug!(scan_job = %scan_job_ref.name, "scan job is not pending, skipping (idempotent under redelivery)");
        return Ok(());
    }

    // step 3.1: history limit, oldest first by the stable annotation.
    let mut siblings = ctx
        .scan_jobs
        .list(&scan_job_ref.namespace, &ListParams::default())
        .await?
        .into_iter()
        .filter(|job| job.spec.registry == scan_job.spec.registry)
        .collect::<Vec<_>>();
    if siblings.len() > ctx.scan_job_history_limit {
        siblings.sort_by_key(stable_creation_time);
        let excess = siblings.len() - ctx.scan_job_history_limit;
        for oldest in siblings.iter().take(excess) {
            if let Err(err) = ctx.scan_jobs.delete(&scan_job_ref.namespace, &oldest.name_any()).await {
                if !err.is_not_found() {
                    return Err(err.into());
                }
            }
        }
    }

    // step 3.2: fetch the Registry; absence fails the job outright.
    let registry = match fetch_optional(ctx.registries.as_ref(), &scan_job_ref.namespace, &scan_job.spec.registry).await? {
        Some(registry) => registry,
        None => {
            retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
                let mut status = current.status.clone().unwrap_or_default();
                state_machine::initialize_conditions(&mut status, generation);
                state_machine::mark_failed(&mut status, "RegistryNotFound", &format!("registry {} not found", scan_job.spec.registry), generation);
                serde_json::to_value(&status).expect("ScanJobStatus always serializes")
            })
            .await?;
            info!(scan_job = %scan_job_ref.name, registry = %scan_job.spec.registry, "scan job failed: registry not found");
            return Ok(());
        }
    };

    // step 3.3: snapshot the Registry spec into the job's annotations.
    let snapshot = serde_json::to_string(&registry.spec).map_err(|e| ReconcileError::Store(crate::errors::StoreError::Kube(kube::Error::Service(Box::new(e)))))?;
    retry_metadata_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |_current| {
        serde_json::json!({ "metadata": { "annotations": { REGISTRY_SNAPSHOT_ANNOTATION: snapshot } } })
    })
    .await?;

    // step 4: publish stage-1, deduped by the job's UID.
    let scan_job_uid = scan_job.uid().unwrap_or_default();
    let message = BaseMessage { scan_job: scan_job_ref.clone() };
    let payload = serde_json::to_vec(&message).map_err(crate::errors::BusError::from)?;
    ctx.bus.publish(SUBJECT_CATALOG_CREATE, &catalog_message_id(&scan_job_uid), payload).await?;

    // step 5: mark Scheduled.
    retry_on_conflict(ctx.scan_jobs.as_ref(), &scan_job_ref.namespace, &scan_job_ref.name, ctx.max_status_retry_attempts, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        state_machine::initialize_conditions(&mut status, generation);
        state_machine::mark_scheduled(&mut status, generation);
        serde_json::to_value(&status).expect("ScanJobStatus always serializes")
    })
    .await?;

    Ok(())
}
