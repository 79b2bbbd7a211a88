//! The `Podder` trait and the shared spec/outcome types both backends speak.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Everything a backend needs to launch and supervise one stage's worker
/// pod. The caller builds this from a resolved `WorkSpec` and a pod name;
/// the backend doesn't know anything about jobs, stages, or readiness.
#[derive(Debug, Clone)]
pub struct PodderSpec {
    pub pod_name: String,
    pub image: String,
    /// The serialized `WorkSpec`, passed to the worker via an environment
    /// variable named after `gangplank_core::workspec::WORK_POD_ENV_VAR`.
    pub work_spec_json: String,
    pub workspace_root: String,
}

/// How a stage's worker pod/container ended.
#[derive(Debug, Clone)]
pub enum PodOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    /// The termination channel fired before the pod reached a terminal state.
    Terminated,
}

/// A backend that can launch and watch a worker's execution environment.
///
/// `run` owns the full lifecycle: create, watch until terminal or
/// `terminate` fires, and unconditionally clean up before returning —
/// cleanup must run even when the termination channel fires or the watch
/// itself errors.
#[async_trait]
pub trait Podder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        spec: PodderSpec,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<PodOutcome>;
}
