//! Worker-side message handlers (C4-C7): the three pipeline stages plus
//! the shared failure path invoked after exhausted retries.

pub mod catalog;
pub mod failure;
pub mod sbom;
pub mod scan;

use crate::bus::MessageBus;
use crate::crd::scan_job::REGISTRY_SNAPSHOT_ANNOTATION;
use crate::crd::{Image, Registry, RegistrySpec, ScanJob, Sbom, VulnerabilityReport};
use crate::errors::HandlerError;
use crate::messages::ResourceRef;
use crate::registry_client::RegistryClientFactory;
use crate::store::Store;
use crate::tools::{ScanTool, SbomTool};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::path::PathBuf;
use std::sync::Arc;

pub struct HandlerContext {
    pub scan_jobs: Arc<dyn Store<ScanJob>>,
    pub images: Arc<dyn Store<Image>>,
    pub sboms: Arc<dyn Store<Sbom>>,
    pub vulnerability_reports: Arc<dyn Store<VulnerabilityReport>>,
    pub registries: Arc<dyn Store<Registry>>,
    pub bus: Arc<dyn MessageBus>,
    pub registry_client_factory: Arc<dyn RegistryClientFactory>,
    pub sbom_tool: Arc<dyn SbomTool>,
    pub scan_tool: Arc<dyn ScanTool>,
    pub max_status_retry_attempts: u32,
    /// Writable working directory for SBOM/scan temp files and
    /// docker-config side channels.
    pub work_dir: PathBuf,
}

/// Returns `Ok(None)` rather than an error when the referent is missing —
/// every handler's "ack-and-stop" path (-4.7 step 1/2) is a deliberate
/// no-op, not a failure.
pub async fn fetch_optional<K, S>(store: &S, reference: &ResourceRef) -> Result<Option<K>, HandlerError>
where
    K: crate::store::StoreResource,
    S: Store<K> + ?Sized,
{
    crate::store::fetch_optional(store, &reference.namespace, &reference.name)
        .await
        .map_err(HandlerError::from)
}

/// Decodes the Registry snapshot from `scan_job`'s annotation
/// "Registry snapshot vs live Registry" — never read the live Registry
/// from inside a worker handler).
pub fn decode_registry_snapshot(scan_job: &ScanJob) -> Result<RegistrySpec, HandlerError> {
    let raw = scan_job
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(REGISTRY_SNAPSHOT_ANNOTATION))
        .ok_or_else(|| HandlerError::MalformedPayload(format!("{} missing registry snapshot annotation", scan_job.name_any())))?;
    serde_json::from_str(raw).map_err(|e| HandlerError::MalformedPayload(e.to_string()))
}

/// Extracts basic-auth credentials from a `kubernetes.io/dockerconfigjson`
/// secret, read live rather than from the job's snapshot (: "Workers
/// still read auth-secrets live, because secrets may be rotated").
pub fn resolve_basic_auth(secret: &Secret) -> Option<(String, String)> {
    let data = secret.data.as_ref()?;
    let raw = data.get(".dockerconfigjson")?;
    let parsed: serde_json::Value = serde_json::from_slice(&raw.0).ok()?;
    let (_, entry) = parsed.get("auths")?.as_object()?.iter().next()?;
    if let (Some(user), Some(pass)) = (entry.get("username").and_then(|v| v.as_str()), entry.get("password").and_then(|v| v.as_str())) {
        return Some((user.to_string(), pass.to_string()));
    }
    let auth = entry.get("auth")?.as_str()?;
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Writes a transient `~/.docker/config.json`-equivalent directory for
/// `registry_uri` under `ctx.work_dir`, for the SBOM tool subprocess's
/// `DOCKER_CONFIG` side channel. Cleaned up when the
/// returned `TempDir` drops, on every exit path including error returns
/// returned `TempDir` drops.
pub fn write_transient_docker_config(work_dir: &std::path::Path, registry_uri: &str, basic_auth: &(String, String)) -> Result<tempfile::TempDir, HandlerError> {
    let dir = tempfile::Builder::new()
        .prefix("sbombastic-docker-config-")
        .tempdir_in(work_dir)
        .map_err(|e| HandlerError::MalformedPayload(format!("failed to create docker-config dir: {e}")))?;

    let (user, pass) = basic_auth;
    let auth = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, format!("{user}:{pass}"));
    let config = serde_json::json!({ "auths": { registry_uri: { "auth": auth } } });
    std::fs::write(dir.path().join("config.json"), serde_json::to_vec(&config).expect("docker config always serializes"))
        .map_err(|e| HandlerError::MalformedPayload(format!("failed to write docker config: {e}")))?;

    Ok(dir)
}
