//! Worker event loops.
//!
//! Each worker is an OS thread running a current-thread tokio runtime and a
//! `LocalSet`. Connections handed to a worker stay on it for their whole
//! life, so the worker's timer queue and cached `Date` header need no
//! synchronization.

use std::cell::{Ref, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, LocalSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::app::App;
use crate::connection::Connection;
use crate::timer::{TimerKey, TimerQueue};

/// How often a worker processes its timers and refreshes the date.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A socket accepted by the acceptor, in transit to a worker.
pub(crate) type Accepted = (std::net::TcpStream, SocketAddr);

/// Per-worker state shared by that worker's connections.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    inner: Rc<WorkerShared>,
}

struct WorkerShared {
    id: usize,
    timers: RefCell<TimerQueue>,
    date: RefCell<String>,
}

impl WorkerContext {
    pub(crate) fn new(id: usize, tick: Duration) -> Self {
        Self {
            inner: Rc::new(WorkerShared {
                id,
                timers: RefCell::new(TimerQueue::new(tick)),
                date: RefCell::new(httpdate::fmt_http_date(SystemTime::now())),
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    /// The cached `Date` header value.
    pub(crate) fn date(&self) -> Ref<'_, String> {
        self.inner.date.borrow()
    }

    pub(crate) fn add_timer<F>(&self, callback: F) -> TimerKey
    where
        F: FnOnce() + 'static,
    {
        self.inner.timers.borrow_mut().add(callback)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.inner.timers.borrow_mut().cancel(key);
    }

    fn tick(&self) {
        *self.inner.date.borrow_mut() = httpdate::fmt_http_date(SystemTime::now());
        let fired = self.inner.timers.borrow_mut().process();
        if fired > 0 {
            debug!(worker = self.inner.id, fired, "connection deadlines expired");
        }
    }
}

/// Runs worker `id` on the current thread until shutdown.
pub(crate) fn run(
    id: usize,
    app: Arc<App>,
    sockets: mpsc::UnboundedReceiver<Accepted>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    let local = LocalSet::new();
    local.block_on(&rt, serve(id, app, sockets, shutdown));
    debug!(worker = id, "worker stopped");
    Ok(())
}

async fn serve(
    id: usize,
    app: Arc<App>,
    mut sockets: mpsc::UnboundedReceiver<Accepted>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ctx = WorkerContext::new(id, app.config().timeout());
    let mut ticker = time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => ctx.tick(),
            accepted = sockets.recv() => {
                let Some((socket, peer)) = accepted else {
                    break;
                };
                match TcpStream::from_std(socket) {
                    Ok(stream) => {
                        let conn = Connection::new(stream, peer, Arc::clone(&app), ctx.clone());
                        task::spawn_local(conn.run());
                    }
                    Err(e) => warn!(worker = id, peer = %peer, error = %e, "failed to register socket"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
