//! Webhook delivery: a fixed pool of workers consuming a bounded queue.
//!
//! Failed deliveries are re-enqueued through a detached timer with an
//! exponentially growing delay, so a retry never occupies a worker. A job is
//! dropped once it exceeds [`MAX_ATTEMPTS`].

use std::{path::PathBuf, time::Duration};

use tokio::{fs, task::JoinHandle};

use parseapid_apid::ParseHostSettings;
use parseapid_common::internal;

pub const QUEUE_DEPTH: usize = 1000;
pub const MAX_ATTEMPTS: u32 = 10;

/// One webhook delivery bound to one recipient of one spooled message.
#[derive(Debug, Clone)]
pub struct PostJob {
    pub message_id: String,
    pub settings: ParseHostSettings,
    pub attempts: u32,
}

impl PostJob {
    pub fn new(message_id: String, settings: ParseHostSettings) -> Self {
        Self {
            message_id,
            settings,
            attempts: 0,
        }
    }
}

/// Bounded MPMC queue feeding the worker pool. Enqueueing blocks when the
/// queue is full; that back-pressure reaches the ingress handler.
#[derive(Clone)]
pub struct PostQueue {
    tx: async_channel::Sender<PostJob>,
    rx: async_channel::Receiver<PostJob>,
}

impl Default for PostQueue {
    fn default() -> Self {
        Self::new(QUEUE_DEPTH)
    }
}

impl PostQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = async_channel::bounded(depth);
        Self { tx, rx }
    }

    pub async fn enqueue(&self, job: PostJob) {
        let _ = self.tx.send(job).await;
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Spawns `concurrency` workers reading spool files from `spool_dir` and
    /// posting them to each job's webhook URL.
    pub fn start_workers(&self, concurrency: usize, spool_dir: PathBuf) -> Vec<JoinHandle<()>> {
        let http = reqwest::Client::new();

        (0..concurrency)
            .map(|_| {
                let queue = self.clone();
                let http = http.clone();
                let spool_dir = spool_dir.clone();
                tokio::spawn(async move {
                    worker(queue, http, spool_dir).await;
                })
            })
            .collect()
    }

    /// Schedules `job` for another attempt after an exponential delay, or
    /// drops it once it has exceeded the attempt cap. Never blocks the
    /// caller; the delay runs on a detached timer.
    pub fn requeue(&self, mut job: PostJob) {
        job.attempts += 1;
        if job.attempts > MAX_ATTEMPTS {
            internal!(level = WARN, "Job exceeded max retries, dropping: {job:?}");
            return;
        }

        let delay = retry_delay(job.attempts);
        internal!(
            level = INFO,
            "Scheduling job to be retried in {:.2} seconds: {job:?}",
            delay.as_secs_f64()
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            internal!(level = INFO, "Putting job back on the queue: {job:?}");
            let _ = tx.send(job).await;
        });
    }
}

/// `exp(attempts)` seconds, truncated to whole seconds.
fn retry_delay(attempts: u32) -> Duration {
    Duration::from_secs(f64::exp(f64::from(attempts)) as u64)
}

async fn worker(queue: PostQueue, http: reqwest::Client, spool_dir: PathBuf) {
    while let Ok(job) = queue.rx.recv().await {
        let path = spool_dir.join(&job.message_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Error reading message, requeueing: '{err}' {job:?}"
                );
                queue.requeue(job);
                continue;
            }
        };

        let email = String::from_utf8_lossy(&data).into_owned();
        let posted = http
            .post(&job.settings.url)
            .form(&[("email", email)])
            .send()
            .await;

        let rsp = match posted {
            Ok(rsp) => rsp,
            Err(err) => {
                internal!(level = ERROR, "Error posting, requeueing: '{err}' job: {job:?}");
                queue.requeue(job);
                continue;
            }
        };

        let status = rsp.status().as_u16();
        if status >= 500 {
            queue.requeue(job);
        } else if status >= 400 {
            internal!(
                level = INFO,
                "Endpoint returned '{status}', dropping job: {job:?}"
            );
        } else if status >= 200 {
            internal!(level = INFO, "Post success '{status}': job: {job:?}");
        }
    }
}
