//! The dispatch core: forms the wave plan, drives readiness polling and
//! stage dispatch wave by wave, and synthesizes the single `process failed`
//! error `Exec` returns on any stage failure.

use std::sync::Arc;
use std::time::Duration;

use gangplank_core::{ArtifactType, BuildIdentity, JobSpec, ReturnTarget, Stage, WorkSpec};
use gangplank_podder::{PodOutcome, Podder, PodderSpec};
use gangplank_store::ObjectStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{Result, SupervisorError};
use crate::plan::form_plan;
use crate::readiness::{log_readiness_timeout, wait_ready, BuildPin};
use crate::termination::TerminationMultiplexer;

/// Everything the dispatch loop needs beyond the JobSpec itself, bound
/// once at construction and shared read-only across every stage task.
///
/// `store` is `Arc`-wrapped because every concurrently dispatched stage
/// needs its own handle to issue store reads; the store's lifecycle
/// (`start`/`kill`) is owned by the caller before/after `exec` runs, when
/// no stage task holds a clone of the `Arc`.
pub struct Supervisor {
    store: Arc<ObjectStore>,
    store_endpoint: String,
    podder: Arc<dyn Podder>,
    build_identity: BuildIdentity,
    worker_image: String,
    readiness_poll_interval: Duration,
    readiness_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        store: ObjectStore,
        store_endpoint: String,
        podder: Arc<dyn Podder>,
        build_identity: BuildIdentity,
        worker_image: impl Into<String>,
        readiness_poll_interval: Duration,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            store: Arc::new(store),
            store_endpoint,
            podder,
            build_identity,
            worker_image: worker_image.into(),
            readiness_poll_interval,
            readiness_timeout,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Tear the store down. Only safe to call once `exec` has returned, so
    /// no stage task still holds a clone of the `Arc`.
    pub async fn shutdown_store(&mut self) -> Result<()> {
        match Arc::get_mut(&mut self.store) {
            Some(store) => Ok(store.kill().await?),
            None => Err(SupervisorError::Internal(
                "store still has outstanding handles; shutdown called while stages are in flight".to_string(),
            )),
        }
    }

    /// Resolve `job` into a wave-scheduled plan and drive it to completion
    /// or first failure. Returns `Ok(())` only if every stage in every wave
    /// succeeded; otherwise `Err(SupervisorError::ProcessFailed)`, matching
    /// the single synthesized "process failed" error.
    pub async fn exec(&self, job: JobSpec, cancellation: CancellationToken) -> Result<()> {
        job.validate()?;

        let waves = form_plan(&job.stages);
        let busiest_wave = waves.iter().map(|w| w.stages.len()).max().unwrap_or(1);

        let mux = TerminationMultiplexer::new(busiest_wave, cancellation);
        let terminate_handle = mux.handle();
        let subscriber = mux.subscriber();
        let mux_task = tokio::spawn(mux.run_until_terminated());

        let pin = BuildPin::new();
        let mut any_failure = false;

        'waves: for wave in &waves {
            info!(order = wave.order, stage_count = wave.stages.len(), "entering wave");

            let mut joins = JoinSet::new();
            for stage in &wave.stages {
                let stage_index = job.stages.iter().position(|s| s.id == stage.id).unwrap_or(0);
                let stage = stage.clone();
                let job_copy = job.deep_copy()?;
                let results_bucket = job.results_bucket.clone();
                let store = self.store.clone();
                let podder = self.podder.clone();
                let build_identity = self.build_identity.clone();
                let worker_image = self.worker_image.clone();
                let store_endpoint = self.store_endpoint.clone();
                let poll_interval = self.readiness_poll_interval;
                let timeout = self.readiness_timeout;
                let pin = pin.clone();
                let mut terminate_rx = subscriber.subscribe();
                let terminate_handle = terminate_handle.clone();

                let span = info_span!("stage", stage = %stage.id, order = wave.order);
                joins.spawn(
                    async move {
                        let outcome = run_one_stage(
                            &stage,
                            stage_index,
                            job_copy,
                            &results_bucket,
                            &store,
                            &store_endpoint,
                            podder,
                            &build_identity,
                            &worker_image,
                            &pin,
                            poll_interval,
                            timeout,
                            &mut terminate_rx,
                        )
                        .await;

                        if let Err(e) = &outcome {
                            terminate_handle.terminate_now(e.to_string()).await;
                        }
                        outcome
                    }
                    .instrument(span),
                );
            }

            // Wave barrier: join every stage of this wave before deciding
            // whether to enter the next one. A failure does not skip the
            // barrier — peers drain as they observe the terminate broadcast.
            while let Some(joined) = joins.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "stage failed");
                        any_failure = true;
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "stage task panicked");
                        any_failure = true;
                    }
                }
            }

            if any_failure {
                warn!("wave failed, not entering next wave");
                break 'waves;
            }
        }

        mux_task.abort();
        let _ = mux_task.await;

        if any_failure {
            Err(SupervisorError::ProcessFailed)
        } else {
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_stage(
    stage: &Stage,
    stage_index: usize,
    job: JobSpec,
    results_bucket: &str,
    store: &ObjectStore,
    store_endpoint: &str,
    podder: Arc<dyn Podder>,
    build_identity: &BuildIdentity,
    worker_image: &str,
    pin: &BuildPin,
    poll_interval: Duration,
    timeout: Duration,
    terminate: &mut tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let readiness = match wait_ready(store, stage, results_bucket, pin, poll_interval, timeout, terminate).await {
        Ok(r) => r,
        Err(SupervisorError::ReadinessTimeout { stage: s, waited }) => {
            log_readiness_timeout(stage, waited);
            return Err(SupervisorError::ReadinessTimeout { stage: s, waited });
        }
        Err(e) => return Err(e),
    };

    let (store_access_key, store_secret_key) = store.credentials().map(|(a, s)| (a.to_string(), s.to_string())).ok_or_else(|| {
        SupervisorError::Internal("store has no credentials; was it started before dispatch?".to_string())
    })?;

    let pod_name = build_identity.pod_name(stage_index);
    let work_spec = WorkSpec {
        job,
        execute_stages: vec![stage.id.clone()],
        remote_files: readiness.remote_files,
        r#return: ReturnTarget {
            store_endpoint: store_endpoint.to_string(),
            store_access_key,
            store_secret_key,
            bucket: results_bucket.to_string(),
            key_prefix: String::new(),
            overwrite: false,
            artifact_types: vec![ArtifactType::Cache, ArtifactType::CacheRepo, ArtifactType::Files],
        },
        api_build: Some(build_identity.clone()),
    };

    let work_spec_json = work_spec.to_env_value()?;
    let podder_spec = PodderSpec {
        pod_name,
        image: worker_image.to_string(),
        work_spec_json,
        workspace_root: work_spec.job.workspace_root.display().to_string(),
    };

    let outcome = podder.run(podder_spec, terminate).await?;
    match outcome {
        PodOutcome::Succeeded => Ok(()),
        PodOutcome::Failed { exit_code, message } => Err(SupervisorError::StageFailed {
            stage: stage.id.to_string(),
            detail: format!("exit_code={exit_code:?}: {message}"),
        }),
        PodOutcome::Terminated => Err(SupervisorError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangplank_core::StageId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stage(id: &str, order: i64) -> Stage {
        Stage {
            id: StageId::new(id),
            execution_order: order,
            concurrent_execution: false,
            build_artifacts: vec![],
            require_artifacts: vec![],
            request_artifacts: vec![],
            require_cache: false,
            request_cache: false,
            require_cache_repo: false,
            request_cache_repo: false,
            return_cache: false,
            return_cache_repo: false,
            return_files: vec![],
            prep_commands: vec![],
            commands: vec![],
            post_commands: vec![],
            post_always: false,
            overrides: vec![],
            env: HashMap::new(),
        }
    }

    fn job(stages: Vec<Stage>) -> JobSpec {
        JobSpec {
            name: "demo".to_string(),
            stages,
            env: HashMap::new(),
            workspace_root: "/srv".into(),
            results_bucket: "builder".to_string(),
            overrides: vec![],
            copy_build: None,
            repo_files: vec![],
        }
    }

    struct MockPodder {
        calls: AtomicUsize,
        /// Stage index (the suffix `pod_name` always ends in) to fail on,
        /// rather than a full pod name — the supervisor synthesizes a
        /// fresh `BuildIdentity` per test, so only the index is stable.
        fail_on_stage_index: Option<usize>,
    }

    #[async_trait::async_trait]
    impl Podder for MockPodder {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(
            &self,
            spec: PodderSpec,
            _terminate: &mut tokio::sync::broadcast::Receiver<()>,
        ) -> gangplank_podder::Result<PodOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let suffix = self
                .fail_on_stage_index
                .map(|idx| format!("-worker-{idx}"));
            if suffix.is_some_and(|s| spec.pod_name.ends_with(&s)) {
                return Ok(PodOutcome::Failed {
                    exit_code: Some(1),
                    message: "boom".to_string(),
                });
            }
            Ok(PodOutcome::Succeeded)
        }
    }

    async fn test_supervisor(podder: Arc<dyn Podder>) -> Supervisor {
        // No embedded-store process is ever spawned in these tests — the
        // store is only touched through `exists`/`get_bytes` calls on
        // `require_artifacts: []` stages, which short-circuit before any
        // network I/O (see readiness::try_satisfy). `external` gives the
        // store real (if unreachable) credentials without spawning anything.
        let store = ObjectStore::external(
            "http://127.0.0.1:1".to_string(),
            "test".to_string(),
            "test".to_string(),
            None,
        )
        .await
        .unwrap();
        Supervisor::new(
            store,
            "http://127.0.0.1:9000".to_string(),
            podder,
            BuildIdentity::synthesize(),
            "quay.io/coreos-assembler/coreos-assembler:latest",
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn single_stage_with_no_dependencies_succeeds() {
        let podder = Arc::new(MockPodder {
            calls: AtomicUsize::new(0),
            fail_on_stage_index: None,
        });
        let supervisor = test_supervisor(podder.clone()).await;
        let job = job(vec![stage("base", 1)]);

        let result = supervisor.exec(job, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(podder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failed_stage_aborts_the_run_and_skips_later_waves() {
        // Stage "a" (order 1, wave 1) is pod index 0; stage "b" (order 3,
        // wave 2) is pod index 1. Failing index 0 must stop the run before
        // wave 2 is ever dispatched.
        let podder = Arc::new(MockPodder {
            calls: AtomicUsize::new(0),
            fail_on_stage_index: Some(0),
        });
        let supervisor = test_supervisor(podder.clone()).await;

        let job = job(vec![stage("a", 1), stage("b", 3)]);
        let result = supervisor.exec(job, CancellationToken::new()).await;

        assert!(matches!(result, Err(SupervisorError::ProcessFailed)));
        assert_eq!(
            podder.calls.load(Ordering::SeqCst),
            1,
            "wave 2's stage must never be dispatched once wave 1 fails"
        );
    }

    #[test]
    fn process_failed_is_the_synthesized_exec_error() {
        let err = SupervisorError::ProcessFailed;
        assert_eq!(err.to_string(), "process failed");
    }
}
