//! Controller-side reconcilers (C3, C8, C9) and the leader-election seam
//! C8 depends on. Each reconciler's core logic is a plain async function
//! over `Store<K>`/`MessageBus` trait objects so it can run against
//! `FakeStore`/`FakeBus` in tests exactly like the worker handlers
//! (`handlers::HandlerContext`) — the binaries wrap these functions with
//! `kube::runtime::Controller`/`tokio::time::interval` driving loops.

pub mod registry;
pub mod scan_job;
pub mod schedule;

use crate::bus::MessageBus;
use crate::crd::{Image, Registry, ScanJob};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;

/// Requeue interval the binaries use for `Action::requeue` on success,
/// mirroring the `kaniop` example's `DEFAULT_RECONCILE_INTERVAL` idiom —
/// a resync safety net on top of the watch, not the primary trigger.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Leader election is an external primitive out of scope here; the
/// schedule runner depends on this trait rather than on any one
/// election library so the core stays agnostic to how leadership is
/// acquired.
pub trait LeaderToken: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-process deployments (tests, local dev) are trivially the leader.
pub struct AlwaysLeader;

impl LeaderToken for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Shared collaborators for the controller-side reconcilers.
pub struct ReconcilerContext {
    pub scan_jobs: Arc<dyn Store<ScanJob>>,
    pub registries: Arc<dyn Store<Registry>>,
    pub images: Arc<dyn Store<Image>>,
    pub bus: Arc<dyn MessageBus>,
    pub scan_job_history_limit: usize,
    pub max_status_retry_attempts: u32,
}
