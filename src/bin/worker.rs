//! `sbombastic-worker`: consumes the three pipeline-stage subjects and
//! dispatches to the catalog/SBOM/scan/failure handlers (C4-C7).
//!
//! Concurrency: a bounded number of handler tasks run in parallel, this
//! binary opens `max_concurrent_handlers` independent pull consumers
//! against the same durable name, which JetStream load-balances across —
//! the `MessageBus::consume` contract itself processes one message at a
//! time per call, so fan-out happens at this level instead.

use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use sbombastic_rs::bus::nats::NatsBus;
use sbombastic_rs::bus::{self, BusMessage};
use sbombastic_rs::config::{self, WorkerConfig};
use sbombastic_rs::crd::{Image, Registry, ScanJob, Sbom, VulnerabilityReport};
use sbombastic_rs::errors::HandlerError;
use sbombastic_rs::handlers::{catalog, failure, sbom, scan, HandlerContext};
use sbombastic_rs::messages::{BaseMessage, GenerateSbomMessage, ScanSbomMessage, SUBJECT_CATALOG_CREATE, SUBJECT_SBOM_GENERATE, SUBJECT_SBOM_SCAN};
use sbombastic_rs::registry_client::oci::OciRegistryClientFactory;
use sbombastic_rs::store::kube_store::KubeStore;
use sbombastic_rs::tools::subprocess::{SubprocessScanTool, SubprocessSbomTool};
use sbombastic_rs::{logger, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sbombastic-worker", about = "Catalog/SBOM/scan pipeline worker")]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Kubeconfig path for out-of-cluster development; in-cluster config is used otherwise.
    #[arg(long)]
    kubeconfig: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config: WorkerConfig = config::load_worker_config(cli.config.as_deref())?;
    logger::init(config.common.log_json);

    let listen_addr = config.common.metrics_listen_addr.parse()?;
    metrics::install_exporter(listen_addr)?;

    let kubeconfig = cli.kubeconfig.as_deref().or(config.common.kubeconfig.as_deref());
    let client = match kubeconfig {
        Some(path) => sbombastic_rs::store::kube_client::from_kubeconfig(path).await?,
        None => sbombastic_rs::store::kube_client::in_cluster().await?,
    };

    let ctx = Arc::new(HandlerContext {
        scan_jobs: Arc::new(KubeStore::<ScanJob>::new(client.clone())),
        images: Arc::new(KubeStore::<Image>::new(client.clone())),
        sboms: Arc::new(KubeStore::<Sbom>::new(client.clone())),
        vulnerability_reports: Arc::new(KubeStore::<VulnerabilityReport>::new(client.clone())),
        registries: Arc::new(KubeStore::<Registry>::new(client.clone())),
        bus: Arc::new(
            NatsBus::connect(
                &config.common.nats_url,
                "sbombastic",
                vec![SUBJECT_CATALOG_CREATE.to_string(), SUBJECT_SBOM_GENERATE.to_string(), SUBJECT_SBOM_SCAN.to_string()],
                config.common.dedup_window,
                Duration::from_secs(5 * 60),
            )
            .await?,
        ),
        registry_client_factory: Arc::new(OciRegistryClientFactory),
        sbom_tool: Arc::new(SubprocessSbomTool::new(config.sbom_tool_binary.clone())),
        scan_tool: Arc::new(SubprocessScanTool::new(config.scan_tool_binary.clone())),
        max_status_retry_attempts: 5,
        work_dir: PathBuf::from(config.work_dir.clone()),
    });
    let secrets: Arc<dyn sbombastic_rs::store::Store<Secret>> = Arc::new(KubeStore::<Secret>::new(client.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let pullers = (0..config.max_concurrent_handlers.max(1)).map(|i| {
        let bus = ctx.bus.clone();
        let ctx = ctx.clone();
        let secrets = secrets.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let handler = dispatcher(ctx, secrets, config);
            if let Err(err) = bus
                .consume(vec![SUBJECT_CATALOG_CREATE.to_string(), SUBJECT_SBOM_GENERATE.to_string(), SUBJECT_SBOM_SCAN.to_string()], "sbombastic-worker", cancel, handler)
                .await
            {
                error!(puller = i, error = %err, "consumer loop exited with an error");
            }
        })
    });

    futures::future::join_all(pullers).await;
    info!("sbombastic-worker shut down cleanly");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received shutdown signal");
        cancel.cancel();
    }
}

/// Builds the per-message dispatch closure: decode by subject, run the
/// matching handler, and apply the retry/failure policy of/ on error.
fn dispatcher(ctx: Arc<HandlerContext>, secrets: Arc<dyn sbombastic_rs::store::Store<Secret>>, config: WorkerConfig) -> Arc<dyn Fn(Box<dyn BusMessage>) -> bus::HandlerFuture + Send + Sync> {
    Arc::new(move |msg: Box<dyn BusMessage>| {
        let ctx = ctx.clone();
        let secrets = secrets.clone();
        let config = config.clone();
        Box::pin(async move { handle_one(ctx, secrets, config, msg).await })
    })
}

async fn handle_one(ctx: Arc<HandlerContext>, secrets: Arc<dyn sbombastic_rs::store::Store<Secret>>, config: WorkerConfig, msg: Box<dyn BusMessage>) -> Result<(), HandlerError> {
    let subject = msg.subject().to_string();
    let num_delivered = msg.num_delivered();
    if num_delivered > 1 {
        metrics::record_message_redelivered(subject_label(&subject));
    }

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let result = dispatch(&ctx, secrets.as_ref(), msg.as_ref(), cancel).await;
    metrics::record_handler_duration(subject_label(&subject), started.elapsed().as_secs_f64());

    match result {
        Ok(()) => msg.ack().await,
        Err(err) => {
            warn!(subject = %subject, num_delivered, error = %err, "handler failed");
            match bus::retry_outcome(num_delivered, config.max_attempts, config.retry_base_delay, config.retry_jitter) {
                bus::RetryOutcome::Nak(delay) => msg.nak(delay).await,
                bus::RetryOutcome::ExhaustedRetries => {
                    if let Ok(base) = serde_json::from_slice::<BaseMessage>(msg.payload()) {
                        if let Err(failure_err) = failure::handle(&ctx, &base.scan_job, &err.to_string()).await {
                            error!(error = %failure_err, "failure handler itself failed");
                        }
                    }
                    msg.ack().await
                }
            }
        }
    }
}

async fn dispatch(ctx: &HandlerContext, secrets: &dyn sbombastic_rs::store::Store<Secret>, msg: &dyn BusMessage, cancel: CancellationToken) -> Result<(), HandlerError> {
    match msg.subject() {
        SUBJECT_CATALOG_CREATE => {
            let decoded: BaseMessage = serde_json::from_slice(msg.payload())?;
            catalog::handle(ctx, &decoded.scan_job, secrets).await
        }
        SUBJECT_SBOM_GENERATE => {
            let decoded: GenerateSbomMessage = serde_json::from_slice(msg.payload())?;
            sbom::handle(ctx, &decoded.base.scan_job, &decoded.image, secrets, msg, cancel).await
        }
        SUBJECT_SBOM_SCAN => {
            let decoded: ScanSbomMessage = serde_json::from_slice(msg.payload())?;
            scan::handle(ctx, &decoded.base.scan_job, &decoded.sbom, msg, cancel).await
        }
        other => Err(HandlerError::MalformedPayload(format!("unexpected subject: {other}"))),
    }
}

fn subject_label(subject: &str) -> &'static str {
    match subject {
        SUBJECT_CATALOG_CREATE => "catalog.create",
        SUBJECT_SBOM_GENERATE => "sbom.generate",
        SUBJECT_SBOM_SCAN => "sbom.scan",
        _ => "unknown",
    }
}
