//! Top-level worker runtime: ties workspace reconstruction, secret
//! injection, stage execution and returns together into the single
//! `Worker::run` entry point a worker pod's `main` calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gangplank_config::TemplateContext;
use gangplank_core::{CloudTarget, WorkSpec};
use gangplank_store::ObjectStore;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{Result, WorkerError};
use crate::publish::{ostree_commit_changed, push_image, RegistrySecretSource};
use crate::reader::AssemblerReader;
use crate::returns::{pack_overrides, upload_returns};
use crate::secrets::inject_secrets;
use crate::workspace::{enter_workspace, ensure_latest_symlink, materialize_repo_files, reconstruct};

const TERMINATION_LOG_PATH: &str = "/dev/termination-log";

/// Configuration for a worker process beyond what travels in the
/// `WorkSpec` itself: things that are environmental to this pod rather
/// than part of the job description.
pub struct WorkerConfig {
    /// Namespace to enumerate labeled secrets in; `None` disables secret
    /// injection entirely (used by the local Docker backend, which has no
    /// Kubernetes API to ask).
    pub kube_namespace: Option<String>,
    /// Registry push credential, resolved by the supervisor/pod spec ahead
    /// of time; `None` disables the OS-image push step.
    pub registry_secret: Option<RegistrySecretSource>,
    pub cloud_target: Option<CloudTarget>,
}

pub struct Worker {
    store: ObjectStore,
    http: reqwest::Client,
    kube_client: Option<kube::Client>,
    assembler: Arc<dyn AssemblerReader>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: ObjectStore,
        kube_client: Option<kube::Client>,
        assembler: Arc<dyn AssemblerReader>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            kube_client,
            assembler,
            config,
        }
    }

    /// Run every stage named in `work_spec.execute_stages`, in order. A
    /// failure on any stage aborts the remaining stages and is returned to
    /// the caller, which (per the pod's contract) surfaces it as a
    /// non-zero exit after the termination log is written.
    pub async fn run(&self, work_spec: WorkSpec) -> Result<()> {
        let workspace_root = work_spec.job.workspace_root.clone();
        enter_workspace(&workspace_root)?;

        let secret_env = self.inject_secrets_if_configured(&workspace_root).await?;

        reconstruct(&self.store, &workspace_root, &work_spec.remote_files).await?;
        materialize_repo_files(&self.http, &workspace_root, &work_spec.job.repo_files).await?;

        let prior_meta = self.assembler.read_meta(&workspace_root).await?;
        if let Some(build_id) = prior_meta.as_ref().and_then(|m| m.get("buildid")).and_then(Value::as_str) {
            ensure_latest_symlink(&workspace_root, build_id).await?;
        }

        let mut final_meta = prior_meta.clone();
        let run_result = self
            .run_stages(&work_spec, &workspace_root, &secret_env, prior_meta.as_ref(), &mut final_meta)
            .await;

        if let Err(e) = self.write_termination_log(final_meta.as_ref()).await {
            warn!(error = %e, "failed to write termination log");
        }

        run_result
    }

    async fn inject_secrets_if_configured(&self, workspace_root: &Path) -> Result<HashMap<String, String>> {
        let (Some(client), Some(namespace)) = (&self.kube_client, &self.config.kube_namespace) else {
            return Ok(HashMap::new());
        };
        let secrets_root = workspace_root.join("secrets");
        inject_secrets(client, namespace, &secrets_root).await
    }

    async fn run_stages(
        &self,
        work_spec: &WorkSpec,
        workspace_root: &Path,
        secret_env: &HashMap<String, String>,
        prior_meta: Option<&Value>,
        final_meta: &mut Option<Value>,
    ) -> Result<()> {
        for (index, stage_id) in work_spec.execute_stages.iter().enumerate() {
            let stage = work_spec
                .job
                .stage(stage_id)
                .ok_or_else(|| WorkerError::Internal(format!("unknown stage in execute_stages: {stage_id}")))?;

            let mut env = work_spec.job.env.clone();
            env.extend(stage.env.clone());
            env.extend(secret_env.clone());

            if let Some(key) = pack_overrides(&self.store, workspace_root, stage, &work_spec.r#return).await? {
                env.insert("GANGPLANK_OVERRIDES_KEY".to_string(), key);
            }

            let ctx = TemplateContext::new()
                .with_env(env.clone())
                .with_meta_json(prior_meta.unwrap_or(&Value::Null));
            let mut ctx = ctx;
            ctx.job.name = work_spec.job.name.clone();
            ctx.job.results_bucket = work_spec.job.results_bucket.clone();
            ctx.stage.name = stage_id.as_str().to_string();
            ctx.stage.index = index;

            let scripts_dir = std::env::temp_dir().join(format!("gangplank-stage-{stage_id}"));
            let pre_stage_meta = self.assembler.read_meta(workspace_root).await?;

            let result = crate::stage_exec::run_stage(stage, &ctx, &env, &scripts_dir, workspace_root).await;
            let _ = tokio::fs::remove_dir_all(&scripts_dir).await;

            match result {
                Ok(()) => {
                    let post_stage_meta = self.assembler.read_meta(workspace_root).await?;
                    if post_stage_meta.is_some() {
                        *final_meta = post_stage_meta.clone();
                    }

                    upload_returns(&self.store, workspace_root, stage, &work_spec.r#return).await?;

                    if ostree_commit_changed(pre_stage_meta.as_ref(), post_stage_meta.as_ref()) {
                        self.maybe_push_image(post_stage_meta.as_ref(), workspace_root).await?;
                    }
                }
                Err(e) => {
                    error!(stage = %stage_id, error = %e, "stage failed, aborting remaining stages");
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn maybe_push_image(&self, meta: Option<&Value>, work_dir: &Path) -> Result<()> {
        let (Some(source), Some(target)) = (&self.config.registry_secret, self.config.cloud_target) else {
            return Ok(());
        };
        let build_id = meta
            .and_then(|m| m.get("buildid"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        push_image(source, target, build_id, work_dir).await
    }

    /// Write the final `meta.json` to both stdout and `/dev/termination-log`
    /// so a pod's "termination reason" field carries the build identity
    /// even after log retention expires.
    async fn write_termination_log(&self, meta: Option<&Value>) -> Result<()> {
        let Some(meta) = meta else { return Ok(()) };
        let rendered = serde_json::to_string(meta)?;
        println!("{rendered}");

        let path = PathBuf::from(TERMINATION_LOG_PATH);
        if let Err(e) = tokio::fs::write(&path, &rendered).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
            info!("termination-log path absent (not running in a pod), skipping");
        }
        Ok(())
    }
}
