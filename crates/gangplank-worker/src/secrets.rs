//! Secret injection: project known secret keys into environment variables
//! and write the rest to files under `/srv/secrets/<kind>/<key>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{info, warn};

use gangplank_config::{catalog, parse_kind, SecretKind, SECRET_LABEL};

use crate::error::Result;

/// For every file written to disk, the companion env-var pointing at it
/// is named `<KIND>_<KEY>_PATH` (upper-cased, non-alnum runs collapsed to
/// `_`), so rendered commands can reference either form.
fn path_env_var_name(kind: SecretKind, key: &str) -> String {
    let kind_name = format!("{kind:?}").to_uppercase();
    let key_name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{kind_name}_{key_name}_PATH")
}

/// Enumerate secrets labeled for Gangplank in the worker's own namespace
/// using its in-pod service-account credentials, project known keys into
/// environment variables, and write the rest under `secrets_root`.
///
/// Returns the full set of environment variables to merge into every
/// stage's command environment. A secret whose kind label is missing or
/// unrecognized is logged and skipped, never failing the run.
pub async fn inject_secrets(
    client: &Client,
    namespace: &str,
    secrets_root: &Path,
) -> Result<HashMap<String, String>> {
    let secrets_api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{SECRET_LABEL}=true"));
    let list = secrets_api.list(&lp).await?;

    let catalog = catalog();
    let mut env = HashMap::new();

    for secret in list.items {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let kind_label = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("gangplank.coreos.com/cosa-secret-kind"))
            .cloned();

        let Some(kind) = kind_label.as_deref().and_then(parse_kind) else {
            warn!(secret = %name, kind = ?kind_label, "unrecognized secret kind, skipping");
            continue;
        };

        let projections = catalog.get(&kind).cloned().unwrap_or_default();
        let Some(data) = secret.data else { continue };

        let kind_dir = secrets_root.join(format!("{kind:?}").to_lowercase());
        tokio::fs::create_dir_all(&kind_dir).await?;

        for (key, value) in data {
            let bytes = value.0;
            if let Some(env_var) = projections.get(key.as_str()) {
                let decoded = String::from_utf8_lossy(&bytes).to_string();
                env.insert(env_var.to_string(), decoded);
                continue;
            }

            let file_path = write_secret_file(&kind_dir, &key, &bytes).await?;
            env.insert(path_env_var_name(kind, &key), file_path.display().to_string());
        }

        info!(secret = %name, kind = ?kind, "injected secret");
    }

    Ok(env)
}

async fn write_secret_file(dir: &Path, key: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(key);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Decode a base64 docker-config blob into the raw JSON bytes a registry
/// login expects (used by `publish::push_image` for cluster-fetched
/// docker-config secrets, which store the value already base64-encoded by
/// the Kubernetes API).
pub fn decode_docker_config(raw: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| crate::error::WorkerError::Internal(format!("docker config decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_env_var_name_is_upper_and_safe() {
        assert_eq!(
            path_env_var_name(SecretKind::Aws, "ca-bundle.pem"),
            "AWS_CA_BUNDLE_PEM_PATH"
        );
    }
}
