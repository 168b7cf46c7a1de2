//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns one socket for its whole life and runs as a single
//! task on its worker. It reads, feeds the parser, dispatches each complete
//! request through the [`App`], writes the response, and then either reads
//! again (keep-alive) or closes. Reads and writes never overlap, and request
//! N+1 is not dispatched before response N has been written.
//!
//! An idle deadline is armed when the connection starts and after each
//! response, and cancelled as soon as a full request has been parsed. When it
//! expires the socket is closed without a response.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::app::App;
use crate::http::parser::{HttpParser, Progress};
use crate::http::request::RequestBuilder;
use crate::http::{Method, Request, Response, StatusCode};
use crate::router::UpgradeHandler;
use crate::server::worker::WorkerContext;
use crate::timer::TimerKey;

/// Initial read buffer capacity.
const INITIAL_BUF_SIZE: usize = 4096;

/// Large bodies are written in pieces of this size.
const WRITE_CHUNK_SIZE: usize = 16 * 1024;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A connection handed over to a protocol-upgrade handler.
///
/// The handler runs on the worker thread; to drive the stream it spawns a
/// task with [`tokio::task::spawn_local`].
#[derive(Debug)]
pub struct Upgraded {
    pub stream: TcpStream,
    /// Bytes received after the upgrade request, not yet consumed.
    pub read_buf: BytesMut,
    pub peer: SocketAddr,
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for or parsing request bytes.
    Reading,
    /// Running middleware and the route handler.
    Dispatching,
    /// Writing a response.
    Writing,
    /// Handed to an upgrade handler; this connection does no more I/O.
    Upgraded,
    Closed,
}

/// What to do after a request has been answered.
enum After {
    KeepAlive,
    Close,
    Upgrade(UpgradeHandler, Request),
}

pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    app: Arc<App>,
    worker: WorkerContext,
    parser: HttpParser,
    builder: RequestBuilder,
    buf: BytesMut,
    state: ConnectionState,
    deadline: Option<TimerKey>,
    expired: Rc<Notify>,
    continue_sent: bool,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, app: Arc<App>, worker: WorkerContext) -> Self {
        let parser = HttpParser::new(app.config().max_head_size);
        Self {
            stream,
            peer,
            app,
            worker,
            parser,
            builder: RequestBuilder::new(),
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            state: ConnectionState::Reading,
            deadline: None,
            expired: Rc::new(Notify::new()),
            continue_sent: false,
        }
    }

    /// Serves the connection until it closes or is upgraded.
    pub(crate) async fn run(mut self) {
        debug!(peer = %self.peer, worker = self.worker.id(), "connection accepted");
        self.arm_deadline();

        let after = match self.serve().await {
            Ok(after) => after,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!(peer = %self.peer, state = ?self.state, "deadline expired, closing");
                After::Close
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "connection error");
                After::Close
            }
        };
        self.cancel_deadline();

        match after {
            After::Upgrade(handler, req) => {
                self.state = ConnectionState::Upgraded;
                debug!(peer = %self.peer, path = %req.path(), "connection upgraded");
                let upgraded = Upgraded {
                    stream: self.stream,
                    read_buf: self.buf,
                    peer: self.peer,
                };
                handler(req, upgraded);
            }
            After::KeepAlive | After::Close => {
                self.state = ConnectionState::Closed;
                let _ = self.stream.shutdown().await;
                trace!(peer = %self.peer, "connection closed");
            }
        }
    }

    async fn serve(&mut self) -> io::Result<After> {
        loop {
            self.state = ConnectionState::Reading;
            let progress = match self.parser.feed(&mut self.buf, &mut self.builder) {
                Ok(progress) => progress,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "protocol error");
                    return Ok(After::Close);
                }
            };

            if self.wants_continue() {
                self.continue_sent = true;
                self.write_all(CONTINUE).await?;
            }

            match progress {
                Progress::Partial => {
                    if self.read().await? == 0 {
                        trace!(peer = %self.peer, "closed by peer");
                        return Ok(After::Close);
                    }
                }
                Progress::Complete => {
                    self.cancel_deadline();
                    self.continue_sent = false;
                    match self.handle_message().await? {
                        After::KeepAlive => self.arm_deadline(),
                        other => return Ok(other),
                    }
                }
            }
        }
    }

    fn wants_continue(&self) -> bool {
        !self.continue_sent
            && self.builder.headers_complete()
            && self.builder.version() == (1, 1)
            && self.builder.headers().value_is("expect", "100-continue")
    }

    async fn handle_message(&mut self) -> io::Result<After> {
        let upgrade = self.builder.is_upgrade();
        let Some(req) = self.builder.take(Some(self.peer)) else {
            return Ok(After::Close);
        };
        let version = req.version();

        let close = if version == (1, 0) {
            !req.headers().has_token("connection", "keep-alive")
        } else {
            req.headers().has_token("connection", "close")
        };
        let add_keep_alive = version == (1, 0) && !close;

        self.state = ConnectionState::Dispatching;
        let mut res = Response::default();
        res.set_head_response(req.method() == Method::Head);
        if version == (1, 1) && !req.headers().contains("host") {
            debug!(peer = %self.peer, "HTTP/1.1 request without Host");
            res.set_code(StatusCode::BadRequest);
            res.end();
        } else if upgrade && !req.headers().value_is("upgrade", "h2c") {
            match self.app.router().handle_upgrade(&req, &mut res) {
                Some(handler) => return Ok(After::Upgrade(handler, req)),
                None => {
                    self.write_response(&mut res, false).await?;
                    return Ok(After::Close);
                }
            }
        } else {
            self.app.handle(&req, &mut res);
        }

        self.write_response(&mut res, add_keep_alive).await?;
        Ok(if close { After::Close } else { After::KeepAlive })
    }

    async fn write_response(&mut self, res: &mut Response, keep_alive_header: bool) -> io::Result<()> {
        self.state = ConnectionState::Writing;
        let threshold = self.app.config().stream_threshold;
        let (mut head, body) = {
            let date = self.worker.date();
            res.serialize(&self.app.config().server_name, &date, keep_alive_header)
        };
        trace!(peer = %self.peer, status = res.code(), len = body.len(), "writing response");

        if body.len() > threshold {
            self.write_all(&head).await?;
            for chunk in body.chunks(WRITE_CHUNK_SIZE) {
                self.write_all(chunk).await?;
            }
        } else {
            head.extend_from_slice(&body);
            self.write_all(&head).await?;
        }
        Ok(())
    }

    async fn read(&mut self) -> io::Result<usize> {
        tokio::select! {
            n = self.stream.read_buf(&mut self.buf) => n,
            () = self.expired.notified() => Err(deadline_expired()),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        tokio::select! {
            r = self.stream.write_all(data) => r,
            () = self.expired.notified() => Err(deadline_expired()),
        }
    }

    fn arm_deadline(&mut self) {
        self.cancel_deadline();
        let expired = Rc::clone(&self.expired);
        self.deadline = Some(self.worker.add_timer(move || expired.notify_waiters()));
    }

    fn cancel_deadline(&mut self) {
        if let Some(key) = self.deadline.take() {
            self.worker.cancel_timer(key);
        }
    }
}

fn deadline_expired() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection deadline expired")
}
