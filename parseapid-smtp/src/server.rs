//! Accept loop, shutdown orchestration, and the seams a mail handler plugs
//! into.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::{broadcast, Mutex, Notify},
    task::JoinSet,
    time::timeout,
};

use parseapid_common::{internal, outgoing, Signal};

use crate::{envelope::Envelope, session::Session};

const MAX_TEMP_DELAY: Duration = Duration::from_secs(1);

/// Receives one envelope per mail transaction, spawned alongside the session
/// at `MAIL FROM`. The handler answers the client through the shared
/// [`Responder`] while the session keeps feeding the envelope.
#[async_trait]
pub trait MailHandler: Send + Sync {
    async fn handle_mail(&self, envelope: Envelope, responder: Responder);
}

/// Shared writing side of a client connection. Both the session and its
/// handler reply through this; each write takes the configured deadline.
#[derive(Clone)]
pub struct Responder {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    write_timeout: Duration,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<Notify>,
}

impl Responder {
    pub(crate) fn new(writer: OwnedWriteHalf, write_timeout: Duration) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            write_timeout,
            closed: Arc::new(AtomicBool::new(false)),
            closed_notify: Arc::new(Notify::new()),
        }
    }

    /// Writes one `CODE SP REASON CRLF` reply line.
    pub async fn write_response(&self, code: u16, reason: &str) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }

        let mut writer = self.writer.lock().await;
        outgoing!("{code} {reason}");
        let line = format!("{code} {reason}\r\n");
        match timeout(self.write_timeout, writer.write_all(line.as_bytes())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    /// Ends the conversation: shuts the write side down and tells the
    /// session to stop reading. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);

        self.closed_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn closed_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.closed_notify)
    }
}

/// Session and message counters, incremented atomically by the accept loop
/// and sessions.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) connections: AtomicU64,
    pub(crate) messages_completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub messages_completed: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            messages_completed: self.messages_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to accept connection: {0}")]
    Accept(#[from] io::Error),
}

pub(crate) struct ServerInner {
    pub(crate) domain: String,
    pub(crate) greeting: String,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) handler: Option<Arc<dyn MailHandler>>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) stats: Stats,
    pub(crate) shutdown: broadcast::Sender<Signal>,
}

impl ServerInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

pub struct ServerBuilder {
    domain: String,
    greeting: Option<String>,
    read_timeout: Duration,
    write_timeout: Duration,
    shutdown_timeout: Duration,
    handler: Option<Arc<dyn MailHandler>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            greeting: None,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            handler: None,
        }
    }
}

impl ServerBuilder {
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    #[must_use]
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[must_use]
    pub const fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MailHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> Server {
        let greeting = self
            .greeting
            .unwrap_or_else(|| format!("{} Service ready", self.domain));
        let (shutdown, _) = broadcast::channel(1);

        Server {
            inner: Arc::new(ServerInner {
                domain: self.domain,
                greeting,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                shutdown_timeout: self.shutdown_timeout,
                handler: self.handler,
                shutting_down: AtomicBool::new(false),
                stats: Stats::default(),
                shutdown,
            }),
        }
    }
}

/// The SMTP receiving edge: accepts connections, runs one session task per
/// client, and drains or force-closes them on shutdown.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Serves connections from `listener` until [`Server::shutdown`] is
    /// called, then waits for live sessions up to the shutdown timeout and
    /// force-closes the rest.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let inner = &self.inner;
        let mut shutdown_rx = inner.shutdown.subscribe();
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut temp_delay = Duration::ZERO;

        if let Ok(addr) = listener.local_addr() {
            internal!(level = INFO, "Starting to serve on {addr}");
        }

        // A shutdown requested before serve started must not be lost
        while !inner.is_shutting_down() {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    internal!(level = INFO, "Server received shutdown signal");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            temp_delay = Duration::ZERO;
                            let id = inner.stats.connections.fetch_add(1, Ordering::Relaxed) + 1;
                            let session = Session::new(stream, peer, Arc::clone(inner), id);
                            sessions.spawn(async move {
                                session.serve().await;
                            });
                        }
                        Err(err) if is_transient(&err) => {
                            temp_delay = if temp_delay.is_zero() {
                                Duration::from_millis(5)
                            } else {
                                (temp_delay * 2).min(MAX_TEMP_DELAY)
                            };
                            internal!(
                                level = INFO,
                                "smtp: Accept error: {err} retrying in {temp_delay:?}"
                            );
                            tokio::time::sleep(temp_delay).await;
                        }
                        Err(err) => return Err(ServerError::Accept(err)),
                    }
                }
            }
        }

        let drained = timeout(inner.shutdown_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            internal!(level = INFO, "All sessions completed");
        } else {
            internal!(level = INFO, "Timed out waiting for sessions to complete");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        Ok(())
    }

    /// Starts a graceful shutdown. Redundant calls are no-ops.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            internal!(level = INFO, "Received redundant shutdown request");
            return;
        }

        let _ = self.inner.shutdown.send(Signal::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

/// Accept errors worth retrying with backoff rather than tearing the loop
/// down.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
