//! Accept loop: binds the daemon's control socket, spawns the PTY pump
//! thread, and dispatches one task per accepted peer connection.
//!
//! Grounded on containrs' `server.rs` (socket bind/remove-stale dance,
//! `SIGINT`/`SIGTERM` handling via `tokio::select!`, `set_logging_verbosity`)
//! adapted from a single `tonic` service to a framed Unix-socket protocol
//! with its own peer registry instead of gRPC's connection handling.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::crate_name;
use log::{debug, info};
use tokio::fs;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::Config;
use crate::dispatch::{handle_peer, Daemon};
use crate::helpers;
use crate::peer::{next_peer_id, PeerHandle};
use crate::pump;

pub struct Server {
    daemon: Arc<Daemon>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Server {
            daemon: Arc::new(Daemon::new(config)),
        }
    }

    pub async fn start(self) -> Result<()> {
        self.set_logging_verbosity()
            .context("set logging verbosity")?;

        let cfg = self.daemon.config.clone();
        helpers::ensure_data_dirs(&cfg).context("create data dirs")?;

        let sock_path = cfg.sock_path();
        if !sock_path.is_absolute() {
            bail!(
                "specified socket path {} is not absolute",
                sock_path.display()
            );
        }
        if sock_path.exists() {
            fs::remove_file(sock_path).await.with_context(|| {
                format!("unable to remove stale socket {}", sock_path.display())
            })?;
        } else if let Some(parent) = sock_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create socket dir {}", parent.display()))?;
        }

        let listener = UnixListener::bind(sock_path)
            .with_context(|| format!("bind {}", sock_path.display()))?;
        info!("cellblockd listening on {}", sock_path.display());

        pump::spawn(cfg.clone(), self.daemon.instances.clone()).context("spawn pty pump")?;

        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.context("accept peer connection")?;
                    let daemon = self.daemon.clone();
                    let peers = self.daemon.peers.clone();
                    let id = next_peer_id();
                    let task = tokio::spawn(async move {
                        handle_peer(daemon, stream).await;
                        peers.remove(id);
                    });
                    self.daemon.peers.insert(id, PeerHandle { task });
                }
                _ = shutdown_interrupt.recv() => {
                    info!("got interrupt signal, shutting down server");
                    break;
                }
                _ = shutdown_terminate.recv() => {
                    info!("got termination signal, shutting down server");
                    break;
                }
            }
        }

        self.cleanup()
    }

    /// Initialize the logger and set the verbosity to the provided level.
    fn set_logging_verbosity(&self) -> Result<()> {
        env::set_var(
            "RUST_LOG",
            format!("{}={}", crate_name!(), self.daemon.config.log_level()),
        );
        env_logger::try_init().context("init env logger")
    }

    fn cleanup(self) -> Result<()> {
        debug!("cleaning up server");
        let sock_path = self.daemon.config.sock_path();
        if sock_path.exists() {
            let _ = std::fs::remove_file(sock_path);
        }
        Ok(())
    }
}
