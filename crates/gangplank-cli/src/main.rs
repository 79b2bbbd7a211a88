//! Gangplank entry point.
//!
//! The same binary is a supervisor when invoked directly and a worker when
//! [`WORK_POD_ENV_VAR`] is present in its environment — a podder backend
//! sets that variable and launches this binary as the pod/container
//! command, so there is no separate worker executable to build or ship.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gangplank_config::SupervisorContext;
use gangplank_core::workspec::WORK_POD_ENV_VAR;
use gangplank_core::{BuildIdentity, CloudTarget, JobSpec, WorkSpec};
use gangplank_podder::{ClusterPodder, LocalPodder, Podder};
use gangplank_store::{ObjectStore, Tunnel, TunnelConfig};
use gangplank_supervisor::seed::{seed_copy_build, seed_prior_build_metadata, seed_source_archive, with_implicit_cosa_stage};
use gangplank_supervisor::Supervisor;
use gangplank_worker::{LocalFsAssemblerReader, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gangplank")]
#[command(about = "Distributed build orchestrator for coreos-assembler pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a JobSpec to completion.
    Run {
        /// Path to a JSON-encoded JobSpec.
        jobspec: PathBuf,

        /// Path to a supervisor-context TOML file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Dispatch worker pods against a local Docker daemon instead of a
        /// Kubernetes cluster.
        #[arg(long)]
        local: bool,

        /// Worker container image.
        #[arg(long, default_value = "quay.io/coreos-assembler/coreos-assembler:latest")]
        worker_image: String,

        /// Kubernetes namespace to dispatch worker pods into; ignored
        /// with `--local`.
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Path to the embedded object store server binary.
        #[arg(long, env = "GANGPLANK_STORE_BINARY", default_value = "minio")]
        store_binary: PathBuf,

        /// A local gzipped source tarball to seed the store with before
        /// dispatch.
        #[arg(long)]
        source_archive: Option<PathBuf>,

        /// A local directory carrying a prior build's `meta.json`/
        /// `builds.json` to re-seed the store with.
        #[arg(long)]
        prior_build_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::var(WORK_POD_ENV_VAR).is_ok() {
        return run_worker().await;
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            jobspec,
            config,
            local,
            worker_image,
            namespace,
            store_binary,
            source_archive,
            prior_build_dir,
        } => {
            run_supervisor(
                jobspec,
                config,
                local,
                worker_image,
                namespace,
                store_binary,
                source_archive,
                prior_build_dir,
            )
            .await
        }
    }
}

/// A worker pod's `main`: read its `WorkSpec` from the environment,
/// reconstruct its workspace, run its assigned stages, upload returns.
async fn run_worker() -> anyhow::Result<()> {
    let raw = std::env::var(WORK_POD_ENV_VAR)
        .map_err(|_| anyhow::anyhow!("{WORK_POD_ENV_VAR} set but unreadable"))?;
    let work_spec = WorkSpec::from_env_value(&raw)?;

    info!(stages = ?work_spec.execute_stages, "starting worker");

    let store = ObjectStore::external(
        work_spec.r#return.store_endpoint.clone(),
        work_spec.r#return.store_access_key.clone(),
        work_spec.r#return.store_secret_key.clone(),
        None,
    )
    .await?;

    // A worker only has a Kubernetes API to ask for secrets when it is
    // itself running as a cluster pod; the local Docker backend leaves
    // this unset and secret injection is skipped entirely.
    let kube_client = kube::Client::try_default().await.ok();
    let kube_namespace = work_spec.api_build.as_ref().map(|b| b.namespace.clone());

    let registry_secret = match std::env::var("GANGPLANK_REGISTRY_SECRET_KIND") {
        Ok(kind) => {
            let payload_raw = std::env::var("GANGPLANK_REGISTRY_SECRET_PAYLOAD").unwrap_or_default();
            let payload: serde_json::Value = serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null);
            Some(gangplank_worker::publish::parse_registry_secret(&kind, payload).await?)
        }
        Err(_) => None,
    };
    let cloud_target = std::env::var("GANGPLANK_CLOUD_TARGET")
        .ok()
        .map(|s| CloudTarget::from_str(&s))
        .transpose()?;

    let worker_config = WorkerConfig {
        kube_namespace,
        registry_secret,
        cloud_target,
    };

    let worker = Worker::new(store, kube_client, Arc::new(LocalFsAssemblerReader), worker_config);
    worker.run(work_spec).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_supervisor(
    jobspec_path: PathBuf,
    config_path: Option<PathBuf>,
    local: bool,
    worker_image: String,
    namespace: String,
    store_binary: PathBuf,
    source_archive: Option<PathBuf>,
    prior_build_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let ctx = SupervisorContext::load(config_path.as_deref())?;
    ctx.validate()?;

    let raw = tokio::fs::read(&jobspec_path).await?;
    let job: JobSpec = serde_json::from_slice(&raw)?;
    job.validate()?;
    let job = with_implicit_cosa_stage(job, &ctx.workspace_root);

    tokio::fs::create_dir_all(&ctx.workspace_root).await?;

    let (mut store, mut tunnel_task) = build_store(&ctx, &store_binary).await?;
    // Kept alive for the run's duration: the tunnel's `serve` loop selects
    // on this sender's channel closing/firing as its terminate signal, so
    // dropping it early would close the channel and end the proxy loop
    // before the first connection ever arrives.
    let (mut tunnel_terminate_tx, store_endpoint) =
        resolve_store_endpoint(&ctx, &mut store, &mut tunnel_task).await?;

    store.ensure_bucket(&ctx.results_bucket).await?;

    if let Some(archive) = &source_archive {
        seed_source_archive(&store, &ctx.results_bucket, &ctx.workspace_root, archive).await?;
    }
    if let Some(prior) = &prior_build_dir {
        seed_prior_build_metadata(&store, &ctx.results_bucket, prior).await?;
    }
    if let Some(copy_build) = &job.copy_build {
        // A prior build referenced for copying is read from the same
        // store this run writes to — there is no second store configured
        // for cross-run copies in this deployment shape.
        seed_copy_build(&store, &ctx.results_bucket, &store, copy_build).await?;
    }

    let podder: Arc<dyn Podder> = if local {
        Arc::new(LocalPodder::connect_local()?)
    } else {
        let pod_watch_timeout = Duration::from_secs(ctx.pod_watch_timeout_secs);
        Arc::new(ClusterPodder::new(namespace, pod_watch_timeout).await?)
    };

    let build_identity = BuildIdentity::synthesize();
    let supervisor = Supervisor::new(
        store,
        store_endpoint,
        podder,
        build_identity,
        worker_image,
        Duration::from_secs(ctx.readiness_poll_interval_secs),
        Duration::from_secs(ctx.readiness_timeout_secs),
    );

    let result = supervisor.exec(job, CancellationToken::new()).await;

    if let Some(tx) = tunnel_terminate_tx.take() {
        let _ = tx.send(());
    }
    if let Some(task) = tunnel_task.take() {
        let _ = task.await;
    }
    let mut supervisor = supervisor;
    if let Err(e) = supervisor.shutdown_store().await {
        warn!(error = %e, "failed to shut down object store");
    }

    result.map_err(anyhow::Error::from)
}

/// Construct the run's `ObjectStore`, unstarted: external mode builds a
/// real client against the configured endpoint; embedded mode builds a
/// placeholder client that `start` replaces once it knows its port.
async fn build_store(
    ctx: &SupervisorContext,
    store_binary: &PathBuf,
) -> anyhow::Result<(ObjectStore, Option<tokio::task::JoinHandle<()>>)> {
    if let Some(ext) = &ctx.external_store {
        let store = ObjectStore::external(
            ext.endpoint.clone(),
            ext.access_key.clone(),
            ext.secret_key.clone(),
            ext.region.clone(),
        )
        .await?;
        return Ok((store, None));
    }

    let placeholder = aws_sdk_s3::config::Builder::new()
        .endpoint_url("http://127.0.0.1:0")
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            "placeholder",
            "placeholder",
            None,
            None,
            "gangplank-placeholder",
        ))
        .force_path_style(true)
        .build();
    let state_dir = ctx.workspace_root.join("store-state");
    tokio::fs::create_dir_all(&state_dir).await?;
    let store = ObjectStore::embedded(
        store_binary.clone(),
        state_dir,
        aws_sdk_s3::Client::from_conf(placeholder),
    );
    Ok((store, None))
}

/// Start the store (and, if configured, the tunnel in front of it). The
/// tunnel reserves its remote port first; the embedded store is then told
/// to bind that same port locally.
///
/// Returns the terminate sender alongside the endpoint when a tunnel was
/// started: the caller must hold it until the run is done, then fire it to
/// signal the tunnel's proxy loop to close its remote listener and return.
#[allow(clippy::type_complexity)]
async fn resolve_store_endpoint(
    ctx: &SupervisorContext,
    store: &mut ObjectStore,
    tunnel_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> anyhow::Result<(Option<tokio::sync::broadcast::Sender<()>>, String)> {
    if store.is_external() {
        store.start(None).await?;
        let endpoint = ctx
            .external_store
            .as_ref()
            .expect("external backend implies external_store config")
            .endpoint
            .clone();
        return Ok((None, endpoint));
    }

    match &ctx.ssh_forward {
        Some(forward) => {
            let local_port = gangplank_store::find_free_port()?;
            let tunnel_config = TunnelConfig {
                host: forward.host.clone(),
                port: forward.port,
                user: forward.user.clone(),
                key_path: forward.key_path.clone(),
                secure: forward.secure,
            };
            let mut tunnel = Tunnel::connect(tunnel_config, local_port).await?;
            let remote_port = tunnel.remote_port();
            store.start(Some(local_port)).await?;

            let host = forward.host.clone();
            let (terminate_tx, mut terminate_rx) = tokio::sync::broadcast::channel::<()>(1);
            let handle = tokio::spawn(async move {
                if let Err(e) = tunnel.serve(local_port, &mut terminate_rx).await {
                    warn!(error = %e, "tunnel proxy loop exited with error");
                }
            });
            *tunnel_task = Some(handle);

            Ok((Some(terminate_tx), format!("http://{host}:{remote_port}")))
        }
        None => {
            let port = store.start(None).await?;
            Ok((None, format!("http://127.0.0.1:{port}")))
        }
    }
}
