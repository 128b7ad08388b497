//! Parser for the line-oriented config format used across the fleet,
//! e.g. `/etc/sendgrid/parseapid.conf`.
//!
//! `#` starts a comment, `[section]` opens a section (nested names like
//! `[section.sub]` are permitted), and `key = value` lines belong to the
//! most recent section. Keys are addressed externally as `section.key`.

use std::{collections::BTreeMap, fmt, io, path::Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to open config file '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("missing config value: line {line}: '{text}'")]
    MissingValue { line: usize, text: String },

    #[error("duplicate config key: line {line}: '{text}'")]
    DuplicateKey { line: usize, text: String },

    #[error("key declared without [section] block: line {line}: '{text}'")]
    KeyOutsideSection { line: usize, text: String },
}

/// The parsed contents of one config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    data: BTreeMap<String, String>,
}

impl Config {
    /// Reads and parses the file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut data = BTreeMap::new();
        let mut prefix = String::new();

        for (idx, raw) in input.lines().enumerate() {
            let line = idx + 1;

            // Everything after '#' is comment
            let payload = raw.split('#').next().unwrap_or("").trim();
            if payload.is_empty() {
                continue;
            }

            if payload.starts_with('[') && payload.ends_with(']') {
                prefix = format!("{}.", &payload[1..payload.len() - 1]);
                continue;
            }

            let parts: Vec<&str> = payload.split('=').collect();
            if parts.len() != 2 {
                return Err(ConfigError::MissingValue {
                    line,
                    text: raw.to_string(),
                });
            }

            let key = parts[0].trim();
            let value = parts[1].trim();

            if prefix.is_empty() {
                return Err(ConfigError::KeyOutsideSection {
                    line,
                    text: raw.to_string(),
                });
            }

            let full = format!("{prefix}{key}");
            if data.contains_key(&full) {
                return Err(ConfigError::DuplicateKey {
                    line,
                    text: raw.to_string(),
                });
            }

            data.insert(full, value.to_string());
        }

        Ok(Self { data })
    }

    /// Returns the value for `key` (`section.key`), or `default` if unset.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.data
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Returns the value for `key` parsed as an integer, or `default` if
    /// unset or unparseable.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.data
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.data
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Renders the config back into its file form, keys grouped under their
/// section headers. `parse(render(c))` yields `c` for any parsed config.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current = "";
        for (full, value) in &self.data {
            // Section is everything up to the final dot; keys never
            // contain dots of their own once rendered this way.
            let (section, key) = full.rsplit_once('.').unwrap_or(("", full.as_str()));
            if section != current {
                if !current.is_empty() {
                    writeln!(f)?;
                }
                writeln!(f, "[{section}]")?;
                current = section;
            }
            writeln!(f, "{key} = {value}")?;
        }
        Ok(())
    }
}
