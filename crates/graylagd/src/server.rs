use crate::config::{Config, SocketType};
use crate::connection::handle_connection;
use crate::error::ServeError;
use arc_swap::ArcSwap;
use graylag_common::store::Store;
use graylag_common::whitelist::WhitelistSet;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Seconds in-flight workers get to finish once the drain starts.
const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Shared state for the policy server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: Config,
    /// The greylisting store.
    pub grey_db: Arc<dyn Store>,
    /// The auto-whitelist store; absent when auto-whitelisting is disabled.
    pub awl_db: Option<Arc<dyn Store>>,
    /// The live whitelist set. Replaced wholesale on reload; readers load a
    /// snapshot and never observe a partial mixture.
    pub whitelist: ArcSwap<WhitelistSet>,
    /// Semaphore bounding concurrently serviced connections.
    conn_limit: Arc<Semaphore>,
}

impl ServerState {
    /// Assembles the shared state with an empty whitelist set.
    #[must_use]
    pub fn new(config: Config, grey_db: Arc<dyn Store>, awl_db: Option<Arc<dyn Store>>) -> Self {
        let conn_limit = Arc::new(Semaphore::new(config.max_conns));
        Self {
            config,
            grey_db,
            awl_db,
            whitelist: ArcSwap::from_pointee(WhitelistSet::default()),
            conn_limit,
        }
    }
}

/// A stream accepted from either listener flavor.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// The single listener the server accepts from.
pub enum Listener {
    /// TCP endpoint.
    Tcp(TcpListener),
    /// Filesystem stream socket.
    Unix(UnixListener),
}

impl Listener {
    /// Binds the listener described by the configuration.
    ///
    /// A unix socket path must not pre-exist; its mode is set right after
    /// the bind. A TCP host is resolved once, here.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        match config.socket_type {
            SocketType::Unix => {
                if config.socket_path.exists() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("socket path {} already exists", config.socket_path.display()),
                    ));
                }
                let listener = UnixListener::bind(&config.socket_path)?;
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::Permissions::from_mode(config.socket_mode)
                };
                std::fs::set_permissions(&config.socket_path, mode)?;
                Ok(Self::Unix(listener))
            }
            SocketType::Inet => {
                let addr = tokio::net::lookup_host((config.listen_host.as_str(), config.listen_port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("listen host {} did not resolve", config.listen_host),
                        )
                    })?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                if config.reuse_socket {
                    socket.set_reuseaddr(true)?;
                }
                socket.bind(addr)?;
                Ok(Self::Tcp(socket.listen(config.listen_backlog)?))
            }
        }
    }

    async fn accept(&self) -> io::Result<(Box<dyn AsyncStream>, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "local".to_owned()))
            }
        }
    }

    /// Where the listener ended up, for the startup log line.
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "tcp".to_owned(), |addr| addr.to_string()),
            Self::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_owned()),
        }
    }

    /// The TCP address actually bound, if any. Tests bind port 0 and need
    /// to learn the real one.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

/// Runs the accept loop until `shutdown` flips, then drains.
///
/// The drain stops accepting, gives in-flight workers a grace period,
/// saves both stores and unlinks a filesystem socket.
///
/// # Errors
///
/// Returns an error only if the listener breaks irrecoverably; individual
/// accept failures are logged and retried.
pub async fn run(
    listener: Listener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServeError> {
    info!("server listening on {}", listener.describe());

    let mut workers = JoinSet::new();
    loop {
        // Hold a permit before accepting so the configured cap bounds the
        // number of connections being serviced.
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&state.conn_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                workers.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(stream, &peer, state).await {
                        debug!("connection from {} closed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }

        // Reap finished workers so the set does not grow with uptime.
        while workers.try_join_next().is_some() {}
    }

    info!(in_flight = workers.len(), "draining");
    let grace = std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS);
    let drained = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("grace period expired, abandoning remaining workers");
        workers.abort_all();
    }

    if let Err(e) = state.grey_db.save().await {
        warn!("greylist store save failed: {}", e);
    }
    if let Some(awl_db) = &state.awl_db {
        if let Err(e) = awl_db.save().await {
            warn!("auto-whitelist store save failed: {}", e);
        }
    }

    if let Listener::Unix(_) = &listener {
        if let Err(e) = std::fs::remove_file(&state.config.socket_path) {
            warn!("could not unlink {}: {}", state.config.socket_path.display(), e);
        }
    }

    info!("shutdown complete");
    Ok(())
}
