//! Error types for ctrlflow-runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for ctrlflow-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors reported by the runtime's fallible setup operations.
///
/// Control-flow outcomes (exceptions, panics, thread exit) never surface
/// here; these are failures of the surrounding OS plumbing.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Failed to read configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// `sigaction` or `raise` failed.
    #[error("Failed to configure {signal}: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to create a thread.
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A thread ended with an ordinary Rust panic.
    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),

    /// Feature not available on this target.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}
