//! Local backend: launches the worker as a Docker container against a
//! local (or ssh://-forwarded) daemon socket.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{DeviceMapping, HostConfig};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{PodderError, Result};
use crate::logs::tee_container_log;
use crate::traits::{PodOutcome, Podder, PodderSpec};

/// Maps container uid 0 onto the host-running user, and reserves a large
/// range starting at 1000 for everything the assembler creates as an
/// unprivileged build user inside the container.
const USERNS_REMAP: &str = "default";

pub struct LocalPodder {
    docker: Docker,
}

impl LocalPodder {
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| PodderError::Internal(format!("docker connect: {e}")))?;
        Ok(Self { docker })
    }

    pub fn connect_uri(uri: &str) -> Result<Self> {
        let docker = Docker::connect_with_http(uri, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| PodderError::Internal(format!("docker connect to {uri}: {e}")))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl Podder for LocalPodder {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(
        &self,
        spec: PodderSpec,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<PodOutcome> {
        let env = vec![format!(
            "{}={}",
            gangplank_core::workspec::WORK_POD_ENV_VAR,
            spec.work_spec_json
        )];

        // An ephemeral named volume for /srv: the worker's workspace must
        // not live only in the container's writable layer, since it's torn
        // down (along with the container) the moment the stage finishes.
        let srv_volume = format!("{}-srv", spec.pod_name);
        self.docker
            .create_volume(CreateVolumeOptions {
                name: srv_volume.clone(),
                ..Default::default()
            })
            .await?;

        let host_config = HostConfig {
            privileged: Some(true),
            network_mode: Some("host".to_string()),
            usernsmode: Some(USERNS_REMAP.to_string()),
            binds: Some(vec![format!("{srv_volume}:{}:rw", spec.workspace_root)]),
            devices: Some(vec![
                DeviceMapping {
                    path_on_host: Some("/dev/kvm".to_string()),
                    path_in_container: Some("/dev/kvm".to_string()),
                    cgroup_permissions: Some("rwm".to_string()),
                },
                DeviceMapping {
                    path_on_host: Some("/dev/fuse".to_string()),
                    path_in_container: Some("/dev/fuse".to_string()),
                    cgroup_permissions: Some("rwm".to_string()),
                },
            ]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.pod_name.clone(),
            platform: None,
        };

        info!(container = %spec.pod_name, "creating worker container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await?;

        let log_dir = PathBuf::from(&spec.workspace_root).join("logs");
        let log_task = tokio::spawn(self.follow_logs_tee(container.id.clone(), log_dir, spec.pod_name.clone()));

        let outcome = self.wait_until_terminal(&container.id, terminate).await;
        log_task.abort();

        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&container.id, Some(remove_options))
            .await
        {
            warn!(container = %container.id, error = %e, "failed to remove worker container during cleanup");
        }

        if let Err(e) = self
            .docker
            .remove_volume(&srv_volume, None::<RemoveVolumeOptions>)
            .await
        {
            warn!(volume = %srv_volume, error = %e, "failed to remove ephemeral /srv volume during cleanup");
        }

        outcome
    }
}

impl LocalPodder {
    async fn wait_until_terminal(
        &self,
        container_id: &str,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<PodOutcome> {
        let mut waits = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        tokio::select! {
            result = waits.next() => match result {
                Some(Ok(response)) if response.status_code == 0 => Ok(PodOutcome::Succeeded),
                Some(Ok(response)) => Ok(PodOutcome::Failed {
                    exit_code: Some(response.status_code as i32),
                    message: format!("worker container exited with status {}", response.status_code),
                }),
                Some(Err(e)) => Err(PodderError::Docker(e)),
                None => Err(PodderError::Orphaned),
            },
            _ = terminate.recv() => Ok(PodOutcome::Terminated),
        }
    }

    /// Stream the container's combined stdout/stderr to `<log_dir>/<pod>-worker.log`
    /// and stdout, prefixed by elapsed time. Runs until the stream ends or
    /// the caller aborts the task.
    fn follow_logs_tee(
        &self,
        container_id: String,
        log_dir: PathBuf,
        pod_name: String,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let docker = self.docker.clone();
        async move {
            let stream = docker.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    timestamps: false,
                    ..Default::default()
                }),
            );
            let stream = stream.map(|r| r.map(|log| log.into_bytes()));
            tee_container_log(stream, &log_dir, &pod_name, "worker", Instant::now()).await;
        }
    }
}
