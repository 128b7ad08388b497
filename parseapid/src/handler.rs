//! Ingress logic for one mail transaction.
//!
//! Runs alongside the SMTP session from `MAIL FROM` onwards: looks up parse
//! settings for each recipient domain as it arrives, spools the message body
//! once DATA completes, acks the client, and fans out one post job per
//! accepted recipient.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, LazyLock},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs;

use parseapid_apid::{Client, ParseHostSettings};
use parseapid_common::internal;
use parseapid_smtp::{EmailAddress, Envelope, MailHandler, Responder};

use crate::post::{PostJob, PostQueue};

pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/parsed/incoming";

static HOSTNAME: LazyLock<String> =
    LazyLock::new(|| gethostname::gethostname().to_string_lossy().into_owned());

pub struct IngressHandler {
    apid: Arc<Client>,
    queue: PostQueue,
    spool_dir: PathBuf,
}

impl IngressHandler {
    pub fn new(apid: Arc<Client>, queue: PostQueue, spool_dir: PathBuf) -> Self {
        Self {
            apid,
            queue,
            spool_dir,
        }
    }

    /// Looks up parse settings for one recipient. `None` means the recipient
    /// must be rejected, either because apid failed or because the domain
    /// has no parse configuration.
    async fn lookup(&self, rcpt: &EmailAddress) -> Option<ParseHostSettings> {
        let domain = rcpt.domain()?;
        internal!(level = DEBUG, "Received recipient domain: {domain}");

        match self.apid.get_parse_host_settings(domain).await {
            Ok(settings) if settings.user_id != 0 => Some(settings),
            Ok(_) => None,
            Err(err) => {
                internal!(level = ERROR, "{err}");
                None
            }
        }
    }
}

#[async_trait]
impl MailHandler for IngressHandler {
    async fn handle_mail(&self, mut envelope: Envelope, responder: Responder) {
        let mut recipients: HashMap<EmailAddress, ParseHostSettings> = HashMap::new();

        while let Some(rcpt) = envelope.next_recipient().await {
            let Some(settings) = self.lookup(&rcpt).await else {
                let _ = responder.write_response(550, "Mailbox unavailable").await;
                responder.close().await;
                return;
            };

            let _ = responder.write_response(250, "Recipient ok").await;
            internal!(
                level = DEBUG,
                "Parse settings for recipient {rcpt}: {settings:?}"
            );
            recipients.insert(rcpt, settings);
        }

        // Recipient sequence closed without DATA: the transaction was reset
        // or the session went away
        if !envelope.data_follows() {
            return;
        }

        let message_id = message_id();
        let path = self.spool_dir.join(&message_id);

        let mut file = match fs::File::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                let _ = responder
                    .write_response(451, "Requested action aborted: local error in processing")
                    .await;
                internal!(level = ERROR, "{err}");
                responder.close().await;
                return;
            }
        };

        let copied = tokio::io::copy(envelope.body(), &mut file).await;
        let bytes = match copied {
            Ok(bytes) if envelope.body_complete() => bytes,
            outcome => {
                let _ = responder
                    .write_response(451, "Requested action aborted: local error in processing")
                    .await;
                let reason = match outcome {
                    Ok(_) => "body ended before the terminating dot".to_string(),
                    Err(err) => err.to_string(),
                };
                internal!(level = ERROR, "{reason}, deleting {message_id}");
                responder.close().await;
                drop(file);
                let _ = fs::remove_file(&path).await;
                return;
            }
        };

        if let Err(err) = file.sync_all().await {
            internal!(level = ERROR, "Error syncing file: {err}");
        }
        drop(file);

        // If the ack never reaches the sender we must not deliver: the
        // sender does not know we accepted the message
        if responder
            .write_response(250, &format!("Queued message {message_id}"))
            .await
            .is_err()
        {
            internal!(
                level = INFO,
                "Error writing response to client, removing message: {message_id}"
            );
            let _ = fs::remove_file(&path).await;
            return;
        }

        internal!(level = INFO, "Queued message {message_id} ({bytes} bytes)");

        // Fan the jobs out without holding up this task; enqueueing blocks
        // when the queue is full
        let queue = self.queue.clone();
        let jobs: Vec<PostJob> = recipients
            .into_values()
            .map(|settings| PostJob::new(message_id.clone(), settings))
            .collect();
        tokio::spawn(async move {
            for job in jobs {
                queue.enqueue(job).await;
            }
        });
    }
}

/// Mints a spool-file name: `hostname.base36(nanos).base36(rand63)`.
pub fn message_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let entropy: u64 = rand::rng().random_range(0..1u64 << 62);

    format!("{}.{}.{}", *HOSTNAME, base36(nanos), base36(entropy))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = [0u8; 13];
    let mut at = out.len();
    while value > 0 {
        at -= 1;
        out[at] = DIGITS[(value % 36) as usize];
        value /= 36;
    }

    String::from_utf8_lossy(&out[at..]).into_owned()
}
