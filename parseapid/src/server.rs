//! Wiring: the SMTP edge, the ingress handler, the post worker pool, and the
//! management listener, assembled into one serveable daemon.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::net::TcpListener;

use parseapid_apid::Client;
use parseapid_common::internal;
use parseapid_smtp::{Server as SmtpServer, StatsSnapshot};

use crate::{
    handler::{IngressHandler, DEFAULT_SPOOL_DIR},
    post::{PostQueue, QUEUE_DEPTH},
};

pub struct ParseServerConfig {
    pub version: String,
    pub worker_concurrency: usize,
    pub spool_dir: PathBuf,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ParseServerConfig {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            worker_concurrency: 2,
            spool_dir: PathBuf::from(DEFAULT_SPOOL_DIR),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct ParseServer {
    smtp: SmtpServer,
    queue: PostQueue,
    worker_concurrency: usize,
    spool_dir: PathBuf,
}

impl ParseServer {
    pub fn new(apid: Arc<Client>, config: ParseServerConfig) -> Self {
        let queue = PostQueue::new(QUEUE_DEPTH);
        let handler = IngressHandler::new(apid, queue.clone(), config.spool_dir.clone());

        let smtp = SmtpServer::builder()
            .with_greeting(format!("Parse API {}", config.version))
            .with_read_timeout(config.read_timeout)
            .with_write_timeout(config.write_timeout)
            .with_shutdown_timeout(config.shutdown_timeout)
            .with_handler(Arc::new(handler))
            .build();

        Self {
            smtp,
            queue,
            worker_concurrency: config.worker_concurrency,
            spool_dir: config.spool_dir,
        }
    }

    /// Binds both listeners and serves. Failure to bind is a startup error.
    pub async fn listen_and_serve(&self, smtp_addr: &str, mgmt_addr: &str) -> anyhow::Result<()> {
        let smtp_listener = TcpListener::bind(smtp_addr).await?;
        let mgmt_listener = TcpListener::bind(mgmt_addr).await?;

        internal!(level = INFO, "Listening on public smtp://{smtp_addr}");
        internal!(level = INFO, "Listening on management http://{mgmt_addr}");

        self.serve(smtp_listener, mgmt_listener).await
    }

    /// Starts the worker pool and serves both listeners until the SMTP edge
    /// shuts down or either listener fails.
    pub async fn serve(
        &self,
        smtp_listener: TcpListener,
        mgmt_listener: TcpListener,
    ) -> anyhow::Result<()> {
        self.queue
            .start_workers(self.worker_concurrency, self.spool_dir.clone());

        tokio::select! {
            served = self.smtp.serve(smtp_listener) => served.map_err(Into::into),
            served = crate::management::serve(mgmt_listener) => {
                served?;
                Ok(())
            }
        }
    }

    /// Starts a graceful shutdown of the SMTP edge; sessions get the
    /// configured drain bound before being force-closed.
    pub fn shutdown(&self) {
        self.smtp.shutdown();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.smtp.stats()
    }
}
