//! Command-line grammar and address validation.
//!
//! Parsing is tolerant by design: one case-insensitive regex extracts the
//! verb and up to 255 characters of argument, and anything unrecognised is
//! left for the state machine to answer with the appropriate 5xx reply.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(helo|ehlo|mail from|data|rcpt to|rset|quit|vrfy):?\s*(.{0,255})?")
        .unwrap()
});

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z.]+$").unwrap());

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^<?(.+)@([^>]+?)>?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Quit,
    Vrfy,
}

impl Command {
    /// Splits a client line into its verb and trimmed argument. Lines with
    /// no recognisable verb yield `(None, "")`.
    pub fn parse(line: &str) -> (Option<Self>, String) {
        let Some(captures) = COMMAND_RE.captures(line) else {
            return (None, String::new());
        };

        let verb = match captures
            .get(1)
            .map(|m| m.as_str().to_ascii_uppercase())
            .as_deref()
        {
            Some("HELO") => Self::Helo,
            Some("EHLO") => Self::Ehlo,
            Some("MAIL FROM") => Self::MailFrom,
            Some("RCPT TO") => Self::RcptTo,
            Some("DATA") => Self::Data,
            Some("RSET") => Self::Rset,
            Some("QUIT") => Self::Quit,
            Some("VRFY") => Self::Vrfy,
            _ => return (None, String::new()),
        };

        let arg = captures
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        (Some(verb), arg)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("Domain '{0}...' longer than 255 chars")]
    DomainTooLong(String),

    #[error("Domain '{0}' does not look like a domain name")]
    NotADomain(String),

    #[error("Doesn't look like an email address")]
    NotAnEmail,
}

/// Accepts strings of at most 255 characters consisting of letters and dots.
pub fn validate_domain(domain: &str) -> Result<(), ValidateError> {
    if domain.len() > 255 {
        return Err(ValidateError::DomainTooLong(
            domain.chars().take(255).collect(),
        ));
    }

    if !DOMAIN_RE.is_match(domain) {
        return Err(ValidateError::NotADomain(domain.to_string()));
    }

    Ok(())
}

/// Accepts `local@domain`, with optional surrounding angle brackets. The
/// local part may contain anything; the domain part anything but `>`.
pub fn validate_email(email: &str) -> Result<(), ValidateError> {
    if !EMAIL_RE.is_match(email) {
        return Err(ValidateError::NotAnEmail);
    }

    Ok(())
}

/// An address as supplied on the wire, brackets and all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    /// The domain portion of the address, if it has one.
    pub fn domain(&self) -> Option<&str> {
        EMAIL_RE
            .captures(&self.0)
            .and_then(|c| c.get(2))
            .map(|m| m.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EmailAddress {
    fn from(addr: &str) -> Self {
        Self(addr.to_string())
    }
}

impl From<String> for EmailAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
