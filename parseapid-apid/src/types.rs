//! Records returned by the apid metadata service.
//!
//! apid encodes booleans as the numbers `0`/`1`; the decoders here map them
//! accordingly. Every field defaults to its zero value when the upstream
//! response omits it.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Error envelope returned by apid on non-200 responses, also used for the
/// client's own failure taxonomy:
///
/// | code | meaning |
/// |------|---------|
/// | 596  | result key missing from response |
/// | 597  | unknown function |
/// | 598  | JSON decode error |
/// | 599  | transport error |
/// | 100–599 | upstream HTTP status, propagated verbatim |
#[derive(Debug, Clone, Default, Deserialize, Error)]
#[error("apid client error {code}: '{message}'")]
#[serde(default)]
pub struct ApidError {
    pub code: u16,
    pub message: String,
    pub traceback: String,
    pub repro: String,
}

impl ApidError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            traceback: String::new(),
            repro: String::new(),
        }
    }
}

fn bool_from_number<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(f64::deserialize(deserializer)? == 1.0)
}

/// Per-recipient-domain parse configuration. A `user_id` of zero means the
/// domain has no parse configuration at all.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParseHostSettings {
    pub user_id: i64,
    pub url: String,
    #[serde(deserialize_with = "bool_from_number")]
    pub spam_check_outgoing: bool,
    #[serde(deserialize_with = "bool_from_number")]
    pub send_raw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimezoneInfo {
    #[serde(rename = "Display")]
    pub display: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Offset")]
    pub offset: i64,
    #[serde(rename = "Timezone")]
    pub timezone: String,
    #[serde(rename = "ID")]
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct User {
    #[serde(rename = "Active")]
    pub active: i64,
    #[serde(rename = "Id")]
    pub id: i64,
    pub outbound_cluster_id: i64,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "UserName")]
    pub user_name: String,
    pub mail_domain: String,
    pub url_domain: String,
    pub plain_text_to_html: bool,
    pub post_event_url: String,
    #[serde(rename = "tzInfo")]
    pub tz_info: TimezoneInfo,
}
