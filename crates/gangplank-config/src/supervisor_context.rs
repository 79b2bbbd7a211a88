//! Supervisor contextual configuration.
//!
//! Loaded from a TOML file via the `config` crate, the way
//! `science-computing-butido` layers its `config::Config` loader — the
//! teacher's own config crate is KDL/pipeline-shaped and has no equivalent
//! for this kind of flat, environment-overridable settings file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/srv")
}

fn default_results_bucket() -> String {
    "builder".to_string()
}

fn default_readiness_poll_interval_secs() -> u64 {
    15
}

fn default_readiness_timeout_secs() -> u64 {
    3600
}

fn default_pod_watch_timeout_secs() -> u64 {
    90 * 60
}

/// Top-level settings the supervisor is constructed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorContext {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_results_bucket")]
    pub results_bucket: String,
    #[serde(default)]
    pub external_store: Option<ExternalStoreConfig>,
    #[serde(default)]
    pub ssh_forward: Option<SshForwardConfig>,
    #[serde(default = "default_readiness_poll_interval_secs")]
    pub readiness_poll_interval_secs: u64,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_pod_watch_timeout_secs")]
    pub pod_watch_timeout_secs: u64,
}

impl Default for SupervisorContext {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            results_bucket: default_results_bucket(),
            external_store: None,
            ssh_forward: None,
            readiness_poll_interval_secs: default_readiness_poll_interval_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            pod_watch_timeout_secs: default_pod_watch_timeout_secs(),
        }
    }
}

/// A pre-existing S3-compatible endpoint Gangplank should use instead of
/// starting its own embedded server ("external mode").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub region: Option<String>,
}

/// SSH reverse-forward configuration. Incompatible with
/// `external_store` — the tunnel exists to reach a store Gangplank itself
/// started and owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshForwardConfig {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Verify the remote host key against `~/.ssh/known_hosts` instead of
    /// accepting any key.
    #[serde(default)]
    pub secure: bool,
}

fn default_ssh_port() -> u16 {
    22
}

impl SupervisorContext {
    /// Load from an optional TOML file, falling back to defaults for
    /// anything unset. Environment variables prefixed `GANGPLANK_` override
    /// file settings, following the same precedence butido's config loader
    /// uses.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GANGPLANK")
                .separator("_")
                .try_parsing(true),
        );
        let built = builder.build()?;
        let ctx: SupervisorContext = built.try_deserialize().unwrap_or_default();
        Ok(ctx)
    }

    /// A tunnel cannot coexist with an externally-configured store: the
    /// tunnel exists to expose a store Gangplank itself started.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.external_store.is_some() && self.ssh_forward.is_some() {
            return Err(crate::error::ConfigError::InvalidValue {
                field: "ssh_forward".to_string(),
                message: "SSH tunnel is incompatible with an external store".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let ctx = SupervisorContext::load(None).unwrap();
        assert_eq!(ctx.workspace_root, PathBuf::from("/srv"));
        assert_eq!(ctx.results_bucket, "builder");
        assert_eq!(ctx.readiness_poll_interval_secs, 15);
    }

    #[test]
    fn tunnel_and_external_store_conflict() {
        let mut ctx = SupervisorContext::default();
        ctx.external_store = Some(ExternalStoreConfig {
            endpoint: "https://s3.example.com".to_string(),
            access_key: "k".to_string(),
            secret_key: "s".to_string(),
            region: None,
        });
        ctx.ssh_forward = Some(SshForwardConfig {
            host: "remote".to_string(),
            user: "core".to_string(),
            key_path: None,
            port: 22,
            secure: false,
        });
        assert!(ctx.validate().is_err());
    }
}
