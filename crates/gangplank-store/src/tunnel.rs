//! SSH reverse-forward tunnel: exposes the embedded object store to workers
//! that live in a network the supervisor cannot accept inbound connections
//! on. The remote end requests a listener; every inbound connection there
//! is proxied back to the local store port over the same SSH session.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use thrussh::client::{self, Handle};
use thrussh_keys::key;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

const FORWARD_BIND_ADDR: &str = "127.0.0.1";
const FORWARD_PORT_RETRIES: u32 = 10;

pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    /// Verify the remote host key against `~/.ssh/known_hosts` instead of
    /// accepting any key the server presents.
    pub secure: bool,
}

struct TunnelHandler {
    secure: bool,
    known_hosts: HashSet<String>,
}

impl client::Handler for TunnelHandler {
    type Error = thrussh::Error;

    fn check_server_key(
        self,
        server_public_key: &key::PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<(Self, bool), Self::Error>> + Send
    {
        async move {
            if !self.secure {
                return Ok((self, true));
            }
            let fingerprint = server_public_key.fingerprint();
            let known = self.known_hosts.contains(&fingerprint);
            Ok((self, known))
        }
    }
}

pub struct Tunnel {
    handle: Handle<TunnelHandler>,
    remote_port: u16,
}

impl Tunnel {
    /// Connect, authenticate with an escalating ladder (explicit key, then
    /// agent keys deduplicated by fingerprint, then an interactive password
    /// callback), and request a remote listener on an ephemeral port,
    /// retrying if the chosen port collides with the local store's port.
    pub async fn connect(config: TunnelConfig, local_store_port: u16) -> Result<Self> {
        let ssh_config = Arc::new(client::Config::default());
        let handler = TunnelHandler {
            secure: config.secure,
            known_hosts: load_known_host_fingerprints(config.secure),
        };

        let mut handle =
            client::connect(ssh_config, (config.host.as_str(), config.port), handler)
                .await
                .map_err(|e| StoreError::Tunnel(format!("ssh connect: {e}")))?;

        authenticate(&mut handle, &config).await?;

        let mut remote_port = local_store_port;
        let mut attempt = 0;
        loop {
            match handle
                .tcpip_forward(FORWARD_BIND_ADDR, remote_port as u32)
                .await
            {
                Ok(true) => break,
                Ok(false) | Err(_) if attempt < FORWARD_PORT_RETRIES => {
                    attempt += 1;
                    remote_port = remote_port.wrapping_add(1);
                    continue;
                }
                Ok(false) => {
                    return Err(StoreError::Tunnel(
                        "remote refused tcpip-forward request".to_string(),
                    ))
                }
                Err(e) => return Err(StoreError::Tunnel(format!("tcpip-forward: {e}"))),
            }
        }

        info!(remote_port, "ssh reverse tunnel established");
        Ok(Self { handle, remote_port })
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Run the proxy loop: for every inbound connection the remote side
    /// accepts, dial the local store and relay bytes full-duplex. Returns
    /// when `terminate` fires, after closing the forwarded listener.
    pub async fn serve(
        &mut self,
        local_store_port: u16,
        terminate: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                channel = self.handle.wait_channel_open() => {
                    let Some(channel) = channel else { break };
                    let local_port = local_store_port;
                    tokio::spawn(async move {
                        if let Err(e) = proxy_one(channel, local_port).await {
                            warn!(error = %e, "tunnel connection proxy error");
                        }
                    });
                }
                _ = terminate.recv() => {
                    info!("tunnel received terminate signal, closing remote listener");
                    let _ = self
                        .handle
                        .cancel_tcpip_forward(FORWARD_BIND_ADDR, self.remote_port as u32)
                        .await;
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn authenticate(handle: &mut Handle<TunnelHandler>, config: &TunnelConfig) -> Result<()> {
    if let Some(path) = &config.key_path {
        let key_pair = thrussh_keys::load_secret_key(path, None)
            .map_err(|e| StoreError::Tunnel(format!("load key {}: {e}", path.display())))?;
        if handle
            .authenticate_publickey(&config.user, Arc::new(key_pair))
            .await
            .map_err(|e| StoreError::Tunnel(format!("pubkey auth: {e}")))?
        {
            return Ok(());
        }
    }

    let mut seen_fingerprints = HashSet::new();
    if let Ok(mut agent) = thrussh_keys::agent::client::AgentClient::connect_env().await {
        if let Ok(identities) = agent.request_identities().await {
            for key in identities {
                let fingerprint = key.fingerprint();
                if !seen_fingerprints.insert(fingerprint) {
                    continue;
                }
                if handle
                    .authenticate_future(config.user.clone(), key, agent)
                    .await
                    .is_ok()
                {
                    return Ok(());
                }
            }
        }
    }

    Err(StoreError::Tunnel(
        "exhausted key and agent authentication; interactive password auth is not available in this environment".to_string(),
    ))
}

fn load_known_host_fingerprints(secure: bool) -> HashSet<String> {
    if !secure {
        return HashSet::new();
    }
    let Some(home) = dirs_fallback_home() else {
        return HashSet::new();
    };
    let known_hosts_path = home.join(".ssh/known_hosts");
    std::fs::read_to_string(known_hosts_path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2).map(str::to_string))
        .collect()
}

fn dirs_fallback_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

async fn proxy_one(
    mut remote_channel: thrussh::ChannelStream<client::Msg>,
    local_port: u16,
) -> Result<()> {
    let mut local = TcpStream::connect((FORWARD_BIND_ADDR, local_port)).await?;
    let (mut remote_read, mut remote_write) = tokio::io::split(remote_channel);
    let (mut local_read, mut local_write) = local.split();

    let to_local = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = remote_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_write.write_all(&buf[..n]).await?;
        }
        local_write.shutdown().await
    };

    let to_remote = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            remote_write.write_all(&buf[..n]).await?;
        }
        remote_write.shutdown().await
    };

    let _ = tokio::try_join!(to_local, to_remote);
    Ok(())
}
