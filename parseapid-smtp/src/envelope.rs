//! One mail transaction in flight between a session and its handler.
//!
//! The session keeps the producing halves ([`EnvelopeFeeder`]) and the
//! handler exclusively owns the [`Envelope`]. Recipients travel over a small
//! channel with a try-send-or-drop discipline, so the session never blocks on
//! a handler that is not listening; body bytes travel over an in-process pipe
//! whose back-pressure is the handler's read speed.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf},
    sync::mpsc,
};

use crate::command::EmailAddress;

/// Size of the body pipe and of the wire read buffer.
pub const DATA_BUF_SIZE: usize = 4 * 1024;

#[derive(Debug, Default)]
struct Flags {
    /// Set when DATA closes the recipient sequence. A recipient channel that
    /// closes without this flag means the transaction was abandoned.
    data_reached: AtomicBool,
    /// Set when the body was terminated by the dot line rather than by the
    /// session or connection going away.
    body_complete: AtomicBool,
}

/// The handler's view of a transaction: sender, the recipient sequence as it
/// arrives, and the streaming message body.
pub struct Envelope {
    pub mail_from: EmailAddress,
    recipients: mpsc::Receiver<EmailAddress>,
    body: ReadHalf<SimplexStream>,
    flags: Arc<Flags>,
}

impl Envelope {
    /// Creates the envelope and its producing halves.
    pub fn channel(mail_from: EmailAddress) -> (Self, EnvelopeFeeder) {
        let (rcpt_tx, rcpt_rx) = mpsc::channel(1);
        let (body_rx, body_tx) = tokio::io::simplex(DATA_BUF_SIZE);
        let flags = Arc::new(Flags::default());

        (
            Self {
                mail_from,
                recipients: rcpt_rx,
                body: body_rx,
                flags: Arc::clone(&flags),
            },
            EnvelopeFeeder {
                recipients: Some(rcpt_tx),
                body: Some(body_tx),
                flags,
            },
        )
    }

    /// Next recipient, or `None` once the sequence is closed.
    pub async fn next_recipient(&mut self) -> Option<EmailAddress> {
        self.recipients.recv().await
    }

    /// True when the recipient sequence was closed by DATA. False means the
    /// transaction was reset or the session died first.
    pub fn data_follows(&self) -> bool {
        self.flags.data_reached.load(Ordering::Acquire)
    }

    /// The streaming message body. Yields EOF once the DATA section ends.
    pub fn body(&mut self) -> &mut (impl tokio::io::AsyncRead + Send + Unpin) {
        &mut self.body
    }

    /// True when the body stream ended with the dot terminator; false when
    /// it ended because the producing side was torn down.
    pub fn body_complete(&self) -> bool {
        self.flags.body_complete.load(Ordering::Acquire)
    }
}

/// The session's producing halves of an envelope.
pub struct EnvelopeFeeder {
    recipients: Option<mpsc::Sender<EmailAddress>>,
    body: Option<WriteHalf<SimplexStream>>,
    flags: Arc<Flags>,
}

impl EnvelopeFeeder {
    /// Offers a recipient without blocking. Returns false if the handler was
    /// not ready for it (the address is dropped).
    pub fn offer_recipient(&self, rcpt: EmailAddress) -> bool {
        self.recipients
            .as_ref()
            .is_some_and(|tx| tx.try_send(rcpt).is_ok())
    }

    /// Closes the recipient sequence, marking that a DATA section follows.
    pub fn begin_data(&mut self) {
        self.flags.data_reached.store(true, Ordering::Release);
        self.recipients.take();
    }

    /// Streams a chunk of body bytes to the handler, blocking while the
    /// handler is behind.
    pub async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.body.as_mut() {
            Some(body) => body.write_all(chunk).await,
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    /// Marks the body complete and closes the pipe, signalling EOF to the
    /// handler.
    pub async fn finish_body(&mut self) {
        self.flags.body_complete.store(true, Ordering::Release);
        if let Some(mut body) = self.body.take() {
            let _ = body.shutdown().await;
        }
    }
}
