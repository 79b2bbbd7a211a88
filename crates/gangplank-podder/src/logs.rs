//! Shared log-streaming plumbing both backends use: write a container's
//! follow stream to a per-pod file under `/srv/logs/<pod>-<container>.log`
//! and to stdout prefixed with `<container> [+<elapsed>]:`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Consume a byte-chunk stream from a container's log follow endpoint,
/// line-buffering is left to the source (chunks are written as received),
/// duplicating every chunk to the pod's log file and to stdout with an
/// elapsed-time prefix. Returns once the stream ends (EOF or error).
pub async fn tee_container_log<S, E>(
    mut stream: S,
    log_dir: &Path,
    pod_name: &str,
    container_name: &str,
    started_at: Instant,
) where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    let log_path: PathBuf = log_dir.join(format!("{pod_name}-{container_name}.log"));
    if let Some(parent) = log_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(dir = %parent.display(), error = %e, "failed to create pod log directory");
        }
    }

    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %log_path.display(), error = %e, "failed to open pod log file, logging to stdout only");
            None
        }
    };

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!(pod = pod_name, container = container_name, error = %e, "log stream error");
                break;
            }
        };

        let elapsed = started_at.elapsed().as_secs();
        for line in String::from_utf8_lossy(&bytes).lines() {
            println!("{container_name} [+{elapsed}s]: {line}");
        }

        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&bytes).await {
                warn!(path = %log_path.display(), error = %e, "failed to append to pod log file");
                file = None;
            }
        }
    }
}
