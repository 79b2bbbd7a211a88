//! The secret-label → environment-variable mapping table.
//!
//! Gangplank doesn't author the secret catalog itself; it owns the
//! closed-set dispatch over it — a secret kind not in the catalog is
//! logged and skipped. Kinds are a fixed enum rather than an open string
//! so an unrecognized kind is a compile-time-checked match arm, not a typo
//! waiting to silently no-op.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The label value Gangplank looks for on in-cluster secrets.
pub const SECRET_LABEL: &str = "gangplank.coreos.com/cosa-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    /// AWS-shaped credentials for S3/cloud publication.
    Aws,
    /// GCP service-account JSON.
    Gcp,
    /// Azure storage/publication credentials.
    Azure,
    /// A registry push docker config (`.dockerconfigjson`).
    DockerConfig,
    /// A generic key/value secret with no special projection.
    Generic,
}

/// A single key's projection: which environment variable it becomes (if
/// any) versus being written to `/srv/secrets/<kind>/<key>` instead.
#[derive(Debug, Clone)]
pub struct KeyProjection {
    pub env_var: Option<&'static str>,
}

/// The static catalog: for each known kind, which of its keys get projected
/// into named environment variables. Keys not listed here still get
/// written to file with a companion `<VAR>_PATH` env-var.
pub fn catalog() -> HashMap<SecretKind, HashMap<&'static str, &'static str>> {
    let mut catalog = HashMap::new();

    let mut aws = HashMap::new();
    aws.insert("access_key_id", "AWS_ACCESS_KEY_ID");
    aws.insert("secret_access_key", "AWS_SECRET_ACCESS_KEY");
    aws.insert("session_token", "AWS_SESSION_TOKEN");
    catalog.insert(SecretKind::Aws, aws);

    let mut gcp = HashMap::new();
    gcp.insert("project_id", "GCP_PROJECT_ID");
    catalog.insert(SecretKind::Gcp, gcp);

    let mut azure = HashMap::new();
    azure.insert("account_name", "AZURE_STORAGE_ACCOUNT");
    azure.insert("account_key", "AZURE_STORAGE_KEY");
    catalog.insert(SecretKind::Azure, azure);

    catalog.insert(SecretKind::DockerConfig, HashMap::new());
    catalog.insert(SecretKind::Generic, HashMap::new());

    catalog
}

/// Parse a secret's `kind` label value into a [`SecretKind`]; unknown
/// values return `None` so the caller can log-and-skip.
pub fn parse_kind(label_value: &str) -> Option<SecretKind> {
    match label_value {
        "aws" => Some(SecretKind::Aws),
        "gcp" => Some(SecretKind::Gcp),
        "azure" => Some(SecretKind::Azure),
        "docker-config" => Some(SecretKind::DockerConfig),
        "generic" => Some(SecretKind::Generic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_none() {
        assert!(parse_kind("quantum-ledger").is_none());
    }

    #[test]
    fn aws_projects_expected_keys() {
        let c = catalog();
        let aws = &c[&SecretKind::Aws];
        assert_eq!(aws.get("access_key_id"), Some(&"AWS_ACCESS_KEY_ID"));
    }
}
