//! Per-connection session state machine.
//!
//! Each state method reads at most one command under the read deadline and
//! reports whether the session should continue. `MAIL FROM` spawns the
//! configured handler with a fresh envelope; the session then feeds it
//! recipients and body bytes as they arrive, never blocking on it.

use std::{fmt, net::SocketAddr, sync::atomic::Ordering, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{tcp::OwnedReadHalf, TcpStream},
    time::timeout,
};

use parseapid_common::{incoming, internal};

use crate::{
    command::{validate_domain, validate_email, Command, EmailAddress},
    envelope::{Envelope, EnvelopeFeeder, DATA_BUF_SIZE},
    server::{Responder, ServerInner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NewConnection,
    GreetingSent,
    ReadyForMail,
    MailFromReceived,
    RcptToReceived,
    DataReceiving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NewConnection => "NEW_CONNECTION",
            Self::GreetingSent => "GREETING_SENT",
            Self::ReadyForMail => "READY_FOR_MAIL",
            Self::MailFromReceived => "MAIL_FROM_RECEIVED",
            Self::RcptToReceived => "RCPT_TO_RECEIVED",
            Self::DataReceiving => "DATA_RECEIVING",
        })
    }
}

pub(crate) struct Session {
    id: u64,
    state: SessionState,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    responder: Responder,
    helo_domain: String,
    feeder: Option<EnvelopeFeeder>,
    server: Arc<ServerInner>,
}

impl Session {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        server: Arc<ServerInner>,
        id: u64,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();

        Self {
            id,
            state: SessionState::NewConnection,
            peer,
            reader: BufReader::new(read_half),
            responder: Responder::new(write_half, server.write_timeout),
            helo_domain: String::new(),
            feeder: None,
            server,
        }
    }

    pub(crate) async fn serve(mut self) {
        internal!(level = DEBUG, "Connected: id={} addr={}", self.id, self.peer);

        loop {
            internal!(level = DEBUG, "Transitioned state: {}", self.state);

            let proceed = match self.state {
                SessionState::NewConnection => self.handle_new_connection().await,
                SessionState::GreetingSent => self.expect_helo().await,
                SessionState::ReadyForMail => self.expect_mail_from().await,
                SessionState::MailFromReceived => self.expect_rcpt_to().await,
                SessionState::RcptToReceived => self.expect_data().await,
                SessionState::DataReceiving => self.receive_data().await,
            };

            if !proceed {
                break;
            }
        }

        internal!(level = DEBUG, "Session closing: id={}", self.id);
        self.responder.close().await;
    }

    async fn handle_new_connection(&mut self) -> bool {
        let _ = self
            .responder
            .write_response(220, &self.server.greeting)
            .await;
        internal!(level = DEBUG, "Wrote greeting: {}", self.server.greeting);
        self.state = SessionState::GreetingSent;
        true
    }

    async fn expect_helo(&mut self) -> bool {
        if self.server.is_shutting_down() {
            internal!(level = INFO, "Server shutdown detected in expect_helo");
            return false;
        }

        let Some((command, arg)) = self.next_client_command().await else {
            return false;
        };

        match command {
            Some(Command::Helo | Command::Ehlo) => {
                if let Err(err) = validate_domain(&arg) {
                    let _ = self
                        .responder
                        .write_response(
                            501,
                            &format!("Syntax error in parameters or arguments: {err}"),
                        )
                        .await;
                    return true;
                }

                self.state = SessionState::ReadyForMail;
                self.helo_domain = arg;
                let _ = self.responder.write_response(250, "OK").await;
                true
            }
            Some(Command::Quit) => {
                let _ = self.responder.write_response(250, "OK").await;
                false
            }
            _ => {
                let _ = self
                    .responder
                    .write_response(503, "Where are your manners?")
                    .await;
                true
            }
        }
    }

    async fn expect_mail_from(&mut self) -> bool {
        if self.server.is_shutting_down() {
            internal!(level = INFO, "Server shutdown detected in expect_mail_from");
            return false;
        }

        let Some((command, arg)) = self.next_client_command().await else {
            return false;
        };

        match command {
            Some(Command::Quit) => {
                let _ = self
                    .responder
                    .write_response(
                        221,
                        &format!("{} Service closing transmission channel", self.server.domain),
                    )
                    .await;
                false
            }
            Some(Command::Rset) => true,
            Some(Command::MailFrom) => {
                if validate_email(&arg).is_err() {
                    let _ = self
                        .responder
                        .write_response(501, "Syntax error in parameters or arguments")
                        .await;
                    return true;
                }

                let _ = self.responder.write_response(250, "OK").await;
                self.state = SessionState::MailFromReceived;

                let (envelope, feeder) = Envelope::channel(EmailAddress::from(arg));
                self.feeder = Some(feeder);

                if let Some(handler) = self.server.handler.clone() {
                    let responder = self.responder.clone();
                    tokio::spawn(async move {
                        handler.handle_mail(envelope, responder).await;
                    });
                }

                true
            }
            _ => {
                let _ = self.responder.write_response(500, "Expected MAIL FROM").await;
                true
            }
        }
    }

    async fn expect_rcpt_to(&mut self) -> bool {
        if self.server.is_shutting_down() {
            internal!(level = INFO, "Server shutdown detected in expect_rcpt_to");
            return false;
        }

        let Some((command, arg)) = self.next_client_command().await else {
            return false;
        };

        match command {
            Some(Command::RcptTo) => {
                if validate_email(&arg).is_err() {
                    let _ = self
                        .responder
                        .write_response(501, "Syntax error in parameters or arguments")
                        .await;
                    return true;
                }

                // Route to the handler if it is keeping up; otherwise the
                // recipient is dropped and acked here.
                let routed = self
                    .feeder
                    .as_ref()
                    .is_some_and(|feeder| feeder.offer_recipient(EmailAddress::from(arg.as_str())));

                if routed {
                    internal!(level = DEBUG, "Sending {arg} to handler");
                } else {
                    internal!(level = DEBUG, "Discarding recipient");
                    let _ = self.responder.write_response(250, "OK").await;
                }

                self.state = SessionState::RcptToReceived;
                true
            }
            Some(Command::Rset) => {
                let _ = self.responder.write_response(250, "OK").await;
                self.state = SessionState::ReadyForMail;
                true
            }
            _ => {
                let _ = self.responder.write_response(500, "Expected RCPT TO").await;
                true
            }
        }
    }

    async fn expect_data(&mut self) -> bool {
        if self.server.is_shutting_down() {
            internal!(level = INFO, "Server shutdown detected in expect_data");
            return false;
        }

        let Some((command, arg)) = self.next_client_command().await else {
            return false;
        };

        match command {
            Some(Command::RcptTo) => {
                if arg.is_empty() {
                    let _ = self
                        .responder
                        .write_response(501, "Syntax error in argument")
                        .await;
                    return true;
                }

                let routed = self
                    .feeder
                    .as_ref()
                    .is_some_and(|feeder| feeder.offer_recipient(EmailAddress::from(arg.as_str())));

                if routed {
                    internal!(level = DEBUG, "Sending additional {arg} to handler");
                } else {
                    internal!(level = DEBUG, "Discarding recipient");
                }

                let _ = self.responder.write_response(250, "OK").await;
                true
            }
            Some(Command::Data) => {
                if let Some(feeder) = self.feeder.as_mut() {
                    feeder.begin_data();
                }
                let _ = self
                    .responder
                    .write_response(354, "Start mail input; end with <CRLF>.<CRLF>")
                    .await;
                self.state = SessionState::DataReceiving;
                true
            }
            _ => {
                let _ = self
                    .responder
                    .write_response(503, "Bad sequence of commands. Try RCPT TO or DATA.")
                    .await;
                true
            }
        }
    }

    /// Streams the DATA section into the envelope until the lone dot,
    /// un-stuffing leading dots and preserving line endings byte-for-byte.
    async fn receive_data(&mut self) -> bool {
        let mut buf: Vec<u8> = Vec::with_capacity(DATA_BUF_SIZE);
        let mut total = 0usize;

        loop {
            if self.responder.is_closed() {
                return false;
            }

            buf.clear();
            let read = timeout(
                self.server.read_timeout,
                self.reader.read_until(b'\n', &mut buf),
            )
            .await;

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    internal!(level = DEBUG, "Error while reading DATA: {err}");
                    return false;
                }
                Err(_) => {
                    internal!(
                        level = DEBUG,
                        "Connection timed out: state={} addr={} helo={}",
                        self.state,
                        self.peer,
                        self.helo_domain
                    );
                    return false;
                }
            };

            // EOF or an unterminated line means the client went away before
            // finishing the section
            if n == 0 || !buf.ends_with(b"\n") {
                internal!(level = DEBUG, "Unexpected end of DATA from {}", self.peer);
                return false;
            }

            let content = match buf.strip_suffix(b"\r\n") {
                Some(stripped) => stripped,
                None => &buf[..buf.len() - 1],
            };

            if content == b".".as_slice() {
                break;
            }

            let payload: &[u8] = if buf.starts_with(b".") { &buf[1..] } else { &buf };
            total += payload.len();

            // The handler going away mid-stream is its problem, not the wire's
            if let Some(feeder) = self.feeder.as_mut() {
                let _ = feeder.write_body(payload).await;
            }
        }

        internal!(level = DEBUG, "Read {total} bytes in DATA");

        if let Some(feeder) = self.feeder.as_mut() {
            feeder.finish_body().await;
        }

        self.server
            .stats
            .messages_completed
            .fetch_add(1, Ordering::Relaxed);
        self.state = SessionState::ReadyForMail;
        true
    }

    async fn next_client_command(&mut self) -> Option<(Option<Command>, String)> {
        let line = self.read_command_line().await?;
        incoming!("{line}");
        Some(Command::parse(&line))
    }

    /// One deadlined line read. `None` closes the session: EOF, timeout,
    /// transport error, and handler-initiated close all end up here.
    async fn read_command_line(&mut self) -> Option<String> {
        if self.responder.is_closed() {
            return None;
        }

        let closed = self.responder.closed_notify();
        let mut line = String::new();

        let read = tokio::select! {
            _ = closed.notified() => return None,
            read = timeout(self.server.read_timeout, self.reader.read_line(&mut line)) => read,
        };

        match read {
            Ok(Ok(0)) => {
                internal!(level = DEBUG, "Client disconnected addr={}", self.peer);
                None
            }
            Ok(Ok(_)) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(err)) => {
                internal!(
                    level = DEBUG,
                    "Error: '{err}' state={} addr={} helo={}",
                    self.state,
                    self.peer,
                    self.helo_domain
                );
                None
            }
            Err(_) => {
                internal!(
                    level = DEBUG,
                    "Connection timed out: state={} addr={} helo={}",
                    self.state,
                    self.peer,
                    self.helo_domain
                );
                None
            }
        }
    }
}
