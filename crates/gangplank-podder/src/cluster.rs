//! Cluster backend: launches the worker as a Kubernetes pod and watches it
//! to completion via a scoped watch stream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{PodderError, Result};
use crate::logs::tee_container_log;
use crate::traits::{PodOutcome, Podder, PodderSpec};

const CA_BUNDLE_VOLUME: &str = "ca-trust";
const SRV_VOLUME: &str = "srv";
const INIT_CONTAINER_NAME: &str = "ca-trust";
const WORKER_CONTAINER_NAME: &str = "worker";

/// Whether this cluster exposes `/dev/kvm` as a schedulable device resource
/// or requires a legacy privileged security context instead. Detected once
/// at construction time from the apiserver version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KvmAccess {
    Device,
    Privileged,
}

pub struct ClusterPodder {
    client: Client,
    namespace: String,
    kvm_access: KvmAccess,
    pod_watch_timeout: Duration,
    label_selector_for_mounts: Option<String>,
}

impl ClusterPodder {
    pub async fn new(namespace: impl Into<String>, pod_watch_timeout: Duration) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| PodderError::Internal(format!("kube client: {e}")))?;
        Self::with_client(client, namespace, pod_watch_timeout).await
    }

    pub async fn with_client(
        client: Client,
        namespace: impl Into<String>,
        pod_watch_timeout: Duration,
    ) -> Result<Self> {
        let kvm_access = detect_kvm_access(&client).await;
        Ok(Self {
            client,
            namespace: namespace.into(),
            kvm_access,
            pod_watch_timeout,
            label_selector_for_mounts: None,
        })
    }

    /// Attach any secrets/configmaps carrying this label as additional
    /// mounts on the worker pod.
    pub fn with_mount_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector_for_mounts = Some(selector.into());
        self
    }

    fn build_pod(&self, spec: &PodderSpec) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "gangplank-worker".to_string());

        let security_context = match self.kvm_access {
            KvmAccess::Device => SecurityContext::default(),
            KvmAccess::Privileged => SecurityContext {
                privileged: Some(true),
                run_as_user: Some(0),
                run_as_group: Some(0),
                ..Default::default()
            },
        };

        let mut resources = ResourceRequirements::default();
        if self.kvm_access == KvmAccess::Device {
            let mut limits = BTreeMap::new();
            limits.insert(
                "devices.kubevirt.io/kvm".to_string(),
                Quantity("1".to_string()),
            );
            resources.limits = Some(limits);
        }

        let init_containers = vec![Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(spec.image.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "cat /etc/pki/cluster/*.crt >> /etc/pki/ca-trust/source/anchors/cluster.crt 2>/dev/null || true".to_string(),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: CA_BUNDLE_VOLUME.to_string(),
                mount_path: "/etc/pki/ca-trust/source/anchors".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }];

        let worker = Container {
            name: WORKER_CONTAINER_NAME.to_string(),
            image: Some(spec.image.clone()),
            env: Some(vec![EnvVar {
                name: gangplank_core::workspec::WORK_POD_ENV_VAR.to_string(),
                value: Some(spec.work_spec_json.clone()),
                ..Default::default()
            }]),
            security_context: Some(security_context),
            resources: Some(resources),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: SRV_VOLUME.to_string(),
                    mount_path: spec.workspace_root.clone(),
                    ..Default::default()
                },
                VolumeMount {
                    name: CA_BUNDLE_VOLUME.to_string(),
                    mount_path: "/etc/pki/ca-trust/source/anchors".to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(spec.pod_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                init_containers: Some(init_containers),
                containers: vec![worker],
                volumes: Some(vec![
                    Volume {
                        name: SRV_VOLUME.to_string(),
                        empty_dir: Some(Default::default()),
                        ..Default::default()
                    },
                    Volume {
                        name: CA_BUNDLE_VOLUME.to_string(),
                        empty_dir: Some(Default::default()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Clusters running Kubernetes 1.24+ can request `/dev/kvm` as a device
/// resource; older clusters need the legacy privileged security context.
const MIN_MINOR_FOR_KVM_DEVICE: u32 = 24;

async fn detect_kvm_access(client: &Client) -> KvmAccess {
    let version = match client.apiserver_version().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "could not query apiserver version, assuming legacy privileged mode");
            return KvmAccess::Privileged;
        }
    };

    let minor: u32 = version.minor.trim_end_matches('+').parse().unwrap_or(0);
    if minor >= MIN_MINOR_FOR_KVM_DEVICE {
        KvmAccess::Device
    } else {
        KvmAccess::Privileged
    }
}

#[async_trait]
impl Podder for ClusterPodder {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn run(
        &self,
        spec: PodderSpec,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<PodOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = self.build_pod(&spec);

        api.create(&PostParams::default(), &pod).await?;
        info!(pod = %spec.pod_name, "created worker pod");

        let outcome = self
            .watch_until_terminal(&api, &spec.pod_name, &spec.workspace_root, terminate)
            .await;

        // Zero-second grace: a stuck pod must never be allowed to stall
        // overall shutdown waiting out Kubernetes' ~30s default.
        let delete_params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        if let Err(e) = api.delete(&spec.pod_name, &delete_params).await {
            warn!(pod = %spec.pod_name, error = %e, "failed to delete worker pod during cleanup");
        }

        outcome
    }
}

impl ClusterPodder {
    async fn watch_until_terminal(
        &self,
        api: &Api<Pod>,
        pod_name: &str,
        workspace_root: &str,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<PodOutcome> {
        let wp = WatchParams::default().fields(&format!("metadata.name={pod_name}"));
        let mut stream = api.watch(&wp, "0").await?.boxed();
        let mut logs_started = false;
        let mut log_tasks: Vec<JoinHandle<()>> = Vec::new();
        let log_dir = PathBuf::from(workspace_root).join("logs");
        let started_at = Instant::now();

        let watch_fut = async {
            loop {
                match stream.next().await {
                    Some(Ok(WatchEvent::Modified(pod))) | Some(Ok(WatchEvent::Added(pod))) => {
                        if !logs_started && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running") {
                            logs_started = true;
                            log_tasks = self.spawn_log_tasks(api, pod_name, &log_dir, started_at);
                        }
                        if let Some(result) = self.inspect_pod(&pod) {
                            return result;
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(_))) => return Ok(PodOutcome::Failed {
                        exit_code: None,
                        message: "worker pod was deleted before reporting completion".to_string(),
                    }),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(PodderError::Kube(e)),
                    None => {
                        return Err(PodderError::Orphaned);
                    }
                }
            }
        };

        let result = tokio::select! {
            result = watch_fut => result,
            _ = tokio::time::sleep(self.pod_watch_timeout) => {
                Err(PodderError::WatchTimeout(self.pod_watch_timeout))
            }
            _ = terminate.recv() => Ok(PodOutcome::Terminated),
        };

        for task in &log_tasks {
            task.abort();
        }
        result
    }

    /// Open a follow stream per container (init + main) and tee it to a
    /// per-pod log file plus stdout.
    fn spawn_log_tasks(
        &self,
        api: &Api<Pod>,
        pod_name: &str,
        log_dir: &PathBuf,
        started_at: Instant,
    ) -> Vec<JoinHandle<()>> {
        [INIT_CONTAINER_NAME, WORKER_CONTAINER_NAME]
            .into_iter()
            .map(|container| {
                let api = api.clone();
                let pod_name = pod_name.to_string();
                let log_dir = log_dir.clone();
                tokio::spawn(async move {
                    let lp = LogParams {
                        follow: true,
                        container: Some(container.to_string()),
                        ..Default::default()
                    };
                    match api.log_stream(&pod_name, &lp).await {
                        Ok(stream) => {
                            let stream = stream.map(|r| r.map_err(PodderError::Kube));
                            tee_container_log(stream, &log_dir, &pod_name, container, started_at).await;
                        }
                        Err(e) => {
                            warn!(pod = %pod_name, container, error = %e, "failed to open log stream");
                        }
                    }
                })
            })
            .collect()
    }

    fn inspect_pod(&self, pod: &Pod) -> Option<Result<PodOutcome>> {
        let status = pod.status.as_ref()?;
        let phase = status.phase.as_deref().unwrap_or("");

        match phase {
            "Succeeded" => Some(Ok(PodOutcome::Succeeded)),
            "Failed" => {
                let exit_code = status
                    .container_statuses
                    .as_ref()
                    .and_then(|cs| cs.first())
                    .and_then(|c| c.state.as_ref())
                    .and_then(|s| s.terminated.as_ref())
                    .map(|t| t.exit_code);
                let message = status
                    .message
                    .clone()
                    .unwrap_or_else(|| "worker pod failed".to_string());
                Some(Ok(PodOutcome::Failed { exit_code, message }))
            }
            _ => None,
        }
    }
}
