//! OS-image push: when a stage produces a new ostree commit, log in to each
//! configured registry and run the cloud's publish command.

use std::path::Path;
use std::process::Stdio;

use gangplank_core::CloudTarget;
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, WorkerError};
use crate::secrets::decode_docker_config;

/// How a registry's login credential is sourced. Closed-set dispatch:
/// an unrecognized type is a configuration error, not silently skipped,
/// because a missed login means every subsequent push silently fails.
#[derive(Debug, Clone)]
pub enum RegistrySecretSource {
    /// The docker-config JSON, already materialized to disk by secret
    /// injection.
    Inline { docker_config_path: String },
    /// A docker-config secret fetched from the cluster, base64-encoded as
    /// the Kubernetes API returns it.
    ClusterDockerConfig { base64_json: String },
    /// A bearer token for registries that accept the pod's service-account
    /// token directly (e.g. an in-cluster registry).
    ServiceAccountToken { token: String, registry: String },
}

pub async fn parse_registry_secret(kind: &str, payload: Value) -> Result<RegistrySecretSource> {
    match kind {
        "inline" => {
            let path = payload
                .get("docker_config_path")
                .and_then(Value::as_str)
                .ok_or_else(|| WorkerError::Internal("inline registry secret missing docker_config_path".into()))?
                .to_string();
            Ok(RegistrySecretSource::Inline { docker_config_path: path })
        }
        "cluster-docker-config" => {
            let b64 = payload
                .get("base64_json")
                .and_then(Value::as_str)
                .ok_or_else(|| WorkerError::Internal("cluster docker config secret missing base64_json".into()))?
                .to_string();
            Ok(RegistrySecretSource::ClusterDockerConfig { base64_json: b64 })
        }
        "service-account-token" => {
            let token = payload
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let registry = payload
                .get("registry")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(RegistrySecretSource::ServiceAccountToken { token, registry })
        }
        other => Err(WorkerError::UnknownRegistrySecretType(other.to_string())),
    }
}

/// Detect whether the stage produced a new ostree commit by comparing the
/// pre-stage and post-stage `meta.json` ostree sha256 fields.
pub fn ostree_commit_changed(pre_meta: Option<&Value>, post_meta: Option<&Value>) -> bool {
    let pre = pre_meta.and_then(|m| m.get("ostree-commit")).and_then(Value::as_str);
    let post = post_meta.and_then(|m| m.get("ostree-commit")).and_then(Value::as_str);
    match (pre, post) {
        (Some(a), Some(b)) => a != b,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Log in to the registry backing `source`, then run `target`'s publish
/// command for `build_id`.
pub async fn push_image(
    source: &RegistrySecretSource,
    target: CloudTarget,
    build_id: &str,
    work_dir: &Path,
) -> Result<()> {
    login(source, work_dir).await?;

    let command = target.render_command(build_id);
    info!(%command, "publishing image");

    let status = Command::new("/bin/bash")
        .arg("-c")
        .arg(&command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(WorkerError::Internal(format!(
            "publish command failed for {target:?}: {status:?}"
        )))
    }
}

async fn login(source: &RegistrySecretSource, work_dir: &Path) -> Result<()> {
    match source {
        RegistrySecretSource::Inline { docker_config_path } => {
            info!(path = %docker_config_path, "using inline docker config for registry login");
            Ok(())
        }
        RegistrySecretSource::ClusterDockerConfig { base64_json } => {
            let decoded = decode_docker_config(base64_json)?;
            let dest = work_dir.join(".docker/config.json");
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, decoded).await?;
            info!(path = %dest.display(), "wrote cluster-fetched docker config");
            Ok(())
        }
        RegistrySecretSource::ServiceAccountToken { token, registry } => {
            if token.is_empty() || registry.is_empty() {
                warn!("service-account-token registry login missing token or registry, skipping login step");
                return Ok(());
            }
            let status = Command::new("podman")
                .args(["login", "-u", "serviceaccount", "--password-stdin", registry])
                .stdin(Stdio::piped())
                .status_with_stdin(token)
                .await?;
            if status.success() {
                Ok(())
            } else {
                Err(WorkerError::Internal(format!(
                    "service-account-token login to {registry} failed: {status:?}"
                )))
            }
        }
    }
}

/// Small extension so the service-account login can pipe the token to
/// stdin without a bespoke process-spawning helper duplicating the rest of
/// `tokio::process::Command`'s builder surface.
trait StatusWithStdin {
    async fn status_with_stdin(self, input: impl Into<String>) -> std::io::Result<std::process::ExitStatus>;
}

impl StatusWithStdin for Command {
    async fn status_with_stdin(mut self, input: impl Into<String>) -> std::io::Result<std::process::ExitStatus> {
        use tokio::io::AsyncWriteExt;
        let mut child = self.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.into().as_bytes()).await?;
        }
        child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ostree_change_is_detected() {
        let pre = json!({"ostree-commit": "aaa"});
        let post = json!({"ostree-commit": "bbb"});
        assert!(ostree_commit_changed(Some(&pre), Some(&post)));
    }

    #[test]
    fn identical_commits_are_not_a_change() {
        let pre = json!({"ostree-commit": "aaa"});
        let post = json!({"ostree-commit": "aaa"});
        assert!(!ostree_commit_changed(Some(&pre), Some(&post)));
    }

    #[test]
    fn absent_pre_meta_with_new_commit_counts_as_changed() {
        let post = json!({"ostree-commit": "bbb"});
        assert!(ostree_commit_changed(None, Some(&post)));
    }

    #[tokio::test]
    async fn unknown_registry_secret_type_is_rejected() {
        let result = parse_registry_secret("quantum-vault", json!({})).await;
        assert!(result.is_err());
    }
}
