#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use graylag_common::store::{self, sanitize_url};
use graylag_common::whitelist;
use graylagd::config::{Args, Config};
use graylagd::metrics::{self, Phase, PhaseCell};
use graylagd::server::{Listener, ServerState};
use graylagd::{reload, server, sweeper};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: Config = args.try_into().map_err(anyhow::Error::msg)?;
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let grey_db = store::open(&config.grey_db).await.with_context(|| {
        format!("opening greylist store {}", sanitize_url(&config.grey_db))
    })?;
    // The auto-whitelist only exists once a trust threshold is set.
    let awl_db = if config.awl_client_count > 0 {
        Some(store::open(&config.awl_db).await.with_context(|| {
            format!("opening auto-whitelist store {}", sanitize_url(&config.awl_db))
        })?)
    } else {
        None
    };

    let state = Arc::new(ServerState::new(config.clone(), grey_db, awl_db));

    let set = whitelist::load_sources(&config.wl_sources, config.allow_wl_regex).await;
    info!(entries = set.len(), "whitelists loaded");
    state.whitelist.store(Arc::new(set));

    let _pid_file = match &config.pid_file {
        Some(path) => Some(write_pid_file(path)?),
        None => None,
    };

    let phase = PhaseCell::new();
    if let Some(metrics_addr) = config.metrics_addr {
        let phase = phase.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics_addr, phase).await {
                warn!("metrics endpoint error: {}", e);
            }
        });
    }

    let listener = Listener::bind(&config).await.context("binding listener")?;
    phase.set(Phase::Serving);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(Arc::clone(&state), phase, shutdown_tx)?;
    tokio::spawn(sweeper::run(Arc::clone(&state), shutdown_rx.clone()));

    server::run(listener, state, shutdown_rx).await?;
    info!("graylagd stopped");
    Ok(())
}

/// SIGHUP rebuilds the whitelists; SIGINT and SIGTERM start the drain.
/// A SIGHUP arriving once the drain has started is ignored.
fn spawn_signal_handler(
    state: Arc<ServerState>,
    phase: PhaseCell,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading whitelists");
                    tokio::spawn(reload::reload_whitelists(Arc::clone(&state)));
                }
                _ = interrupt.recv() => break,
                _ = terminate.recv() => break,
            }
        }
        info!("shutdown signal received");
        phase.set(Phase::Draining);
        let _ = shutdown_tx.send(true);
    });
    Ok(())
}

/// Removes the pid file again on clean shutdown.
struct PidFile {
    path: PathBuf,
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Writes the decimal pid with O_EXCL semantics and mode 0644; an existing
/// file aborts startup.
fn write_pid_file(path: &Path) -> Result<PidFile> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("writing pid file {}", path.display()))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(PidFile {
        path: path.to_path_buf(),
    })
}
