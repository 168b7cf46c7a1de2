//! Multi-worker TCP server.
//!
//! One acceptor task hands accepted sockets to `workers` event loops in
//! round-robin order. Each worker is an OS thread with its own
//! current-thread runtime (see [`worker`]). Shutdown stops the acceptor and
//! every worker; connections still open are dropped, not drained.

pub(crate) mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::config::ConfigError;
use crate::router::RouteError;

use worker::Accepted;

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors produced while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Signals a running [`Server`] to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A bound, validated server, ready to [`run`](Self::run).
///
/// # Examples
///
/// ```rust,no_run
/// use corvid::{App, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new().port(8080);
///     app.route("/")?.to(|| "Hello, World!")?;
///
///     let server = Server::bind(app).await?;
///     println!("listening on http://{}", server.local_addr());
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    app: Arc<App>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Validates `app` and binds its configured address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] or [`ServerError::Route`] for an invalid
    /// application, [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(mut app: App) -> Result<Self, ServerError> {
        app.validate()?;

        let addr = app.config().socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = watch::channel(false);

        info!(
            addr = %local_addr,
            workers = app.config().workers,
            server = %app.config().server_name,
            "server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            app: Arc::new(app),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// The address actually bound; useful with port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown is signalled.
    ///
    /// # Errors
    ///
    /// [`ServerError::Spawn`] if a worker thread cannot be started.
    pub async fn run(self) -> Result<(), ServerError> {
        let worker_count = self.app.config().workers;
        let mut senders = Vec::with_capacity(worker_count);
        let mut threads: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel::<Accepted>();
            let app = Arc::clone(&self.app);
            let shutdown = self.shutdown.tx.subscribe();
            let spawned = thread::Builder::new()
                .name(format!("corvid-worker-{index}"))
                .spawn(move || {
                    if let Err(e) = worker::run(index, app, rx, shutdown) {
                        error!(worker = index, error = %e, "worker failed to start");
                    }
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    self.shutdown.shutdown();
                    return Err(ServerError::Spawn { index, source });
                }
            }
            senders.push(tx);
        }

        info!(addr = %self.local_addr, workers = worker_count, "server running");
        self.accept_loop(&senders).await;

        self.shutdown.shutdown();
        drop(senders);
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "failed to join worker threads");
        }
        info!("server stopped");
        Ok(())
    }

    async fn accept_loop(&self, senders: &[mpsc::UnboundedSender<Accepted>]) {
        let mut shutdown = self.shutdown.tx.subscribe();
        // Only this task touches the counter.
        let mut next = 0usize;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let socket = match stream.into_std() {
                        Ok(socket) => socket,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "failed to detach socket");
                            continue;
                        }
                    };
                    let index = next % senders.len();
                    next = next.wrapping_add(1);
                    debug!(peer = %peer, worker = index, "connection assigned");
                    if senders[index].send((socket, peer)).is_err() {
                        warn!(worker = index, "worker is gone, dropping connection");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }
}
