pub mod client;
pub mod types;

pub use client::{Args, Client, FunctionMetadata, ManifestError};
pub use types::{ApidError, ParseHostSettings, TimezoneInfo, User};
