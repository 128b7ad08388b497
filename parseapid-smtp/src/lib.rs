//! Streaming SMTP receiver.
//!
//! The server accepts connections and runs one [`session::Session`] per
//! client. When a transaction reaches `MAIL FROM`, the session spawns the
//! configured [`server::MailHandler`] and streams recipients and body bytes
//! to it through the [`envelope::Envelope`]; the handler answers the client
//! through a shared [`server::Responder`].

pub mod command;
pub mod envelope;
pub mod server;
pub mod session;

pub use command::{validate_domain, validate_email, Command, EmailAddress};
pub use envelope::{Envelope, EnvelopeFeeder};
pub use server::{MailHandler, Responder, Server, ServerBuilder, Stats, StatsSnapshot};
pub use session::SessionState;
