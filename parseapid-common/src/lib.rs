pub mod config;
pub mod logging;

pub use tracing;

/// Value broadcast to every listener and session when the process is asked
/// to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
