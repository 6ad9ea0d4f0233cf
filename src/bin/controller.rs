//! `sbombastic-controller`: runs the ScanJob reconciler, the
//! Registry reconciler, and the periodic schedule runner.

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Resource, ResourceExt};
use sbombastic_rs::bus::nats::NatsBus;
use sbombastic_rs::config::{self, ControllerConfig};
use sbombastic_rs::crd::{Image, Registry, ScanJob};
use sbombastic_rs::errors::ReconcileError;
use sbombastic_rs::messages::{ResourceRef, SUBJECT_CATALOG_CREATE, SUBJECT_SBOM_GENERATE, SUBJECT_SBOM_SCAN};
use sbombastic_rs::reconcile::{self, AlwaysLeader, ReconcilerContext};
use sbombastic_rs::store::kube_store::KubeStore;
use sbombastic_rs::{logger, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sbombastic-controller", about = "ScanJob/Registry reconcilers and the periodic schedule runner")]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Kubeconfig path for out-of-cluster development; in-cluster config is used otherwise.
    #[arg(long)]
    kubeconfig: Option<String>,
    /// Namespace the controller watches. All components in this system are namespace-scoped.
    #[arg(long, default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_controller_config(cli.config.as_deref())?;
    logger::init(config.common.log_json);

    let listen_addr = config.common.metrics_listen_addr.parse()?;
    metrics::install_exporter(listen_addr)?;

    let kubeconfig = cli.kubeconfig.as_deref().or(config.common.kubeconfig.as_deref());
    let client = match kubeconfig {
        Some(path) => sbombastic_rs::store::kube_client::from_kubeconfig(path).await?,
        None => sbombastic_rs::store::kube_client::in_cluster().await?,
    };

    let bus = NatsBus::connect(
        &config.common.nats_url,
        "sbombastic",
        vec![SUBJECT_CATALOG_CREATE.to_string(), SUBJECT_SBOM_GENERATE.to_string(), SUBJECT_SBOM_SCAN.to_string()],
        config.common.dedup_window,
        Duration::from_secs(5 * 60),
    )
    .await?;

    let ctx = Arc::new(ReconcilerContext {
        scan_jobs: Arc::new(KubeStore::<ScanJob>::new(client.clone())),
        registries: Arc::new(KubeStore::<Registry>::new(client.clone())),
        images: Arc::new(KubeStore::<Image>::new(client.clone())),
        bus: Arc::new(bus),
        scan_job_history_limit: config.scan_job_history_limit,
        max_status_retry_attempts: 5,
    });

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let schedule_handle = tokio::spawn(reconcile::schedule::run(
        ctx.clone(),
        cli.namespace.clone(),
        Arc::new(AlwaysLeader),
        config.schedule_tick_interval,
        cancel.clone(),
    ));

    let scan_job_controller = run_scan_job_controller(ctx.clone(), client.clone(), cli.namespace.clone(), cancel.clone());
    let registry_controller = run_registry_controller(ctx.clone(), client.clone(), cli.namespace.clone(), cancel.clone());

    tokio::join!(scan_job_controller, registry_controller);
    schedule_handle.await.ok();

    info!("sbombastic-controller shut down cleanly");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received shutdown signal");
        cancel.cancel();
    }
}

fn resource_ref<K>(obj: &K) -> ResourceRef
where
    K: Resource<Scope = NamespaceResourceScope> + ResourceExt,
{
    ResourceRef { name: obj.name_any(), namespace: obj.namespace().unwrap_or_default() }
}

async fn run_scan_job_controller(ctx: Arc<ReconcilerContext>, client: kube::Client, namespace: String, cancel: CancellationToken) {
    let api: Api<ScanJob> = Api::namespaced(client, &namespace);
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(
            |job, ctx| {
                let reference = resource_ref(job.as_ref());
                async move { reconcile::scan_job::reconcile(&ctx, &reference).await.map(|_| Action::requeue(reconcile::DEFAULT_RESYNC_INTERVAL)) }
            },
            |_job, err: &ReconcileError, _ctx| {
                warn!(error = %err, "scan job reconcile failed, requeuing");
                Action::requeue(Duration::from_secs(30))
            },
            ctx,
        )
        .for_each(|result| async move {
            if let Err(err) = result {
                error!(error = %err, "scan job controller stream errored");
            }
        })
        .await;
}

async fn run_registry_controller(ctx: Arc<ReconcilerContext>, client: kube::Client, namespace: String, cancel: CancellationToken) {
    let api: Api<Registry> = Api::namespaced(client, &namespace);
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(
            |registry, ctx| {
                let reference = resource_ref(registry.as_ref());
                async move { reconcile::registry::reconcile(&ctx, &reference).await.map(|_| Action::requeue(reconcile::DEFAULT_RESYNC_INTERVAL)) }
            },
            |_registry, err: &ReconcileError, _ctx| {
                warn!(error = %err, "registry reconcile failed, requeuing");
                Action::requeue(Duration::from_secs(30))
            },
            ctx,
        )
        .for_each(|result| async move {
            if let Err(err) = result {
                error!(error = %err, "registry controller stream errored");
            }
        })
        .await;
}
