//! The S3-compatible object store client: either an embedded server this
//! process owns the lifecycle of, or a pre-existing external endpoint.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::process::{find_free_port, ManagedProcess};

/// Object tag carrying the upload timestamp used for freshness comparisons.
pub const STAMP_TAG_KEY: &str = "gangplank.coreos.com/cosa/stamp";

/// Metadata artifacts are eligible for overwrite if the local copy is
/// strictly newer than the remote stamp; everything else is write-once.
const METADATA_PREFIXES: &[&str] = &[
    "meta",
    "manifest-lock.generated",
    "ostree-commit-object",
    "commitmeta.json",
    "coreos-assembler-config-git.json",
    "builds.json",
];

pub fn is_metadata_object(key: &str) -> bool {
    let filename = key.rsplit('/').next().unwrap_or(key);
    METADATA_PREFIXES
        .iter()
        .any(|prefix| filename.starts_with(prefix))
}

enum Backend {
    Embedded {
        process: ManagedProcess,
        port: u16,
        access_key: String,
        secret_key: String,
    },
    External {
        access_key: String,
        secret_key: String,
    },
}

pub struct ObjectStore {
    client: Client,
    backend: Option<Backend>,
    binary_path: PathBuf,
    state_dir: PathBuf,
}

impl ObjectStore {
    /// Construct an embedded-mode store. `Start` must be called before any
    /// I/O method is used.
    pub fn embedded(binary_path: PathBuf, state_dir: PathBuf, client: Client) -> Self {
        Self {
            client,
            backend: None,
            binary_path,
            state_dir,
        }
    }

    /// Construct against a pre-existing endpoint; `Start`/`Kill` are no-ops.
    pub async fn external(
        endpoint: String,
        access_key: String,
        secret_key: String,
        region: Option<String>,
    ) -> Result<Self> {
        let credentials = Credentials::new(&access_key, &secret_key, None, None, "gangplank-config");
        let config = aws_sdk_s3::config::Builder::new()
            .endpoint_url(endpoint)
            .region(Region::new(region.unwrap_or_else(|| "us-east-1".to_string())))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: Client::from_conf(config),
            backend: Some(Backend::External { access_key, secret_key }),
            binary_path: PathBuf::new(),
            state_dir: PathBuf::new(),
        })
    }

    pub fn is_external(&self) -> bool {
        matches!(self.backend, Some(Backend::External { .. }))
    }

    /// The credentials workers need to reach this store themselves, so the
    /// supervisor can pass them along in a `WorkSpec`'s `ReturnTarget`.
    /// `None` before `start`/`external` has run.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match &self.backend {
            Some(Backend::Embedded { access_key, secret_key, .. }) => Some((access_key, secret_key)),
            Some(Backend::External { access_key, secret_key }) => Some((access_key, secret_key)),
            None => None,
        }
    }

    /// Start the embedded server, binding the next free port starting at
    /// 9000 unless `forced_port` is given (used when a tunnel has already
    /// reserved the remote side and both ends must agree).
    pub async fn start(&mut self, forced_port: Option<u16>) -> Result<u16> {
        match &self.backend {
            // External mode: the endpoint already exists and is reachable;
            // starting is a no-op.
            Some(Backend::External { .. }) => return Ok(0),
            Some(Backend::Embedded { .. }) => return Err(StoreError::AlreadyStarted),
            None => {}
        }

        let port = match forced_port {
            Some(p) => p,
            None => find_free_port()?,
        };

        let access_key = uuid::Uuid::now_v7().simple().to_string();
        let secret_key = uuid::Uuid::now_v7().simple().to_string();

        let envs = vec![
            ("GANGPLANK_STORE_ACCESS_KEY".to_string(), access_key.clone()),
            ("GANGPLANK_STORE_SECRET_KEY".to_string(), secret_key.clone()),
        ];
        let args = vec![
            "--address".to_string(),
            format!("127.0.0.1:{port}"),
            "--data-dir".to_string(),
            self.state_dir.display().to_string(),
        ];

        let process = ManagedProcess::spawn(&self.binary_path, &args, &envs, self.state_dir.clone())?;
        info!(port, "embedded object store started");

        let credentials = Credentials::new(&access_key, &secret_key, None, None, "gangplank-embedded");
        let config = aws_sdk_s3::config::Builder::new()
            .endpoint_url(format!("http://127.0.0.1:{port}"))
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        self.client = Client::from_conf(config);
        self.backend = Some(Backend::Embedded { process, port, access_key, secret_key });

        Ok(port)
    }

    /// Tear the embedded server down. A no-op in external mode — this
    /// store never owned that endpoint's lifecycle.
    pub async fn kill(&mut self) -> Result<()> {
        match &mut self.backend {
            Some(Backend::Embedded { process, .. }) => process.kill().await,
            Some(Backend::External { .. }) | None => Ok(()),
        }
    }

    pub async fn wait(&mut self) -> Result<()> {
        match &mut self.backend {
            Some(Backend::Embedded { process, .. }) => {
                process.wait().await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn ensure_bucket(&self, name: &str) -> Result<()> {
        let exists = self
            .client
            .head_bucket()
            .bucket(name)
            .send()
            .await
            .is_ok();
        if exists {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;
        Ok(())
    }

    pub async fn put(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_string();
        let tagging = format!("{STAMP_TAG_KEY}={stamp}");
        if let Err(e) = self
            .client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(
                aws_sdk_s3::types::Tagging::builder()
                    .tag_set(
                        aws_sdk_s3::types::Tag::builder()
                            .key(STAMP_TAG_KEY)
                            .value(stamp)
                            .build()
                            .map_err(|e| StoreError::S3(e.to_string()))?,
                    )
                    .build()
                    .map_err(|e| StoreError::S3(e.to_string()))?,
            )
            .send()
            .await
        {
            warn!(bucket, key, error = %e, tagging, "failed to write upload stamp tag");
        }
        Ok(())
    }

    pub async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;

        let last_modified = output.last_modified().cloned();
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?
            .into_bytes();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;

        if let Some(lm) = last_modified {
            let mtime = filetime::FileTime::from_unix_time(lm.secs(), 0);
            let _ = filetime::set_file_mtime(dest, mtime);
        }

        Ok(())
    }

    /// Put a blob straight from memory, e.g. a freshly-rendered
    /// `meta.json`/`builds.json` the supervisor seeds ahead of dispatch,
    /// without a caller having to round-trip it through a temp file.
    pub async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_string();
        if let Err(e) = self
            .client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(
                aws_sdk_s3::types::Tagging::builder()
                    .tag_set(
                        aws_sdk_s3::types::Tag::builder()
                            .key(STAMP_TAG_KEY)
                            .value(&stamp)
                            .build()
                            .map_err(|e| StoreError::S3(e.to_string()))?,
                    )
                    .build()
                    .map_err(|e| StoreError::S3(e.to_string()))?,
            )
            .send()
            .await
        {
            warn!(bucket, key, error = %e, stamp, "failed to write upload stamp tag");
        }
        Ok(())
    }

    /// Read an object straight into memory, e.g. for the readiness poll's
    /// repeated small reads of `builds.json`/`meta.json` where writing to a
    /// temp file would be pure overhead.
    pub async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?
            .into_bytes();
        Ok(body.to_vec())
    }

    pub async fn exists(&self, bucket: &str, key: &str) -> bool {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .is_ok()
    }

    /// Compare the local file's mtime to the remote stamp tag (falling back
    /// to the object's LastModified when untagged). On any error
    /// determining the remote side, the answer is `false`: an unreachable
    /// store must never cause an overwrite of fresher remote content.
    pub async fn is_local_newer(&self, bucket: &str, key: &str, path: &Path) -> Result<bool> {
        let local_mtime = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let remote_nanos = match self.remote_stamp_nanos(bucket, key).await {
            Ok(n) => n,
            Err(e) => {
                debug!(bucket, key, error = %e, "remote freshness lookup failed, refusing to overwrite");
                return Ok(false);
            }
        };

        debug!(bucket, key, local_mtime, remote_nanos, "freshness comparison");
        Ok(local_mtime > remote_nanos)
    }

    /// Resolve the remote stamp nanos for `bucket/key`. Errors distinguish
    /// "the object genuinely has no stamp" (falls back to `LastModified`,
    /// or `0` if that's absent too — a fresh key that should lose to any
    /// local mtime) from "we couldn't talk to the store" (propagated as an
    /// error so the caller treats it as "do not overwrite").
    async fn remote_stamp_nanos(&self, bucket: &str, key: &str) -> Result<u128> {
        let tagging = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;

        if let Some(tag) = tagging.tag_set().iter().find(|t| t.key() == STAMP_TAG_KEY) {
            if let Ok(n) = tag.value().parse::<u128>() {
                return Ok(n);
            }
        }

        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;
        let nanos = head
            .last_modified()
            .map(|lm| (lm.secs().max(0) as u128) * 1_000_000_000)
            .unwrap_or(0);
        Ok(nanos)
    }
}
