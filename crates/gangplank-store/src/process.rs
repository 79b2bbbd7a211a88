//! Lifecycle of the embedded S3-compatible server child process: binds the
//! next free port, spawns into its own process group so the whole subtree
//! can be reaped with one signal, and tears it down on `Kill`.

use std::net::TcpListener;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Result, StoreError};

const FIRST_PORT: u16 = 9000;
const PORT_SCAN_RANGE: u16 = 1000;

/// Find the next free TCP port starting at `FIRST_PORT`, binding briefly to
/// confirm availability before handing it to the child process.
pub fn find_free_port() -> Result<u16> {
    for port in FIRST_PORT..FIRST_PORT.saturating_add(PORT_SCAN_RANGE) {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(StoreError::NoFreePort(FIRST_PORT))
}

pub struct ManagedProcess {
    child: Child,
    state_dir: PathBuf,
}

impl ManagedProcess {
    /// Spawn `binary` with `args`/`envs`, placing it in a new process group
    /// headed by its own pid so `kill` can reap the whole subtree at once.
    pub fn spawn(
        binary: &Path,
        args: &[String],
        envs: &[(String, String)],
        state_dir: PathBuf,
    ) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(StoreError::Spawn)?;
        info!(pid = ?child.id(), binary = %binary.display(), "spawned embedded store process");
        Ok(Self { child, state_dir })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Negative-pgid SIGTERM to the whole process group, then wait for the
    /// child to exit, then remove the on-disk state directory. Safe to call
    /// more than once.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.child.id() {
            let pgid = Pid::from_raw(-(pid as i32));
            match signal::kill(pgid, Signal::SIGTERM) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(error = %e, "failed to signal embedded store process group"),
            }
        }

        match self.child.wait().await {
            Ok(status) => info!(?status, "embedded store process exited"),
            Err(e) => warn!(error = %e, "error waiting on embedded store process"),
        }

        if self.state_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.state_dir).await {
                warn!(dir = %self.state_dir.display(), error = %e, "failed to remove store state directory");
            }
        }

        Ok(())
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }
}
