//! Unified error types for guestnet
//!
//! Only configuration, pool construction, script parsing and channel
//! failures are errors. Runtime shortages (no free subnet, unknown
//! interface kind, unusable routing table) surface as `None`/`false`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for guestnet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Event script errors
    #[error("Script line {line}: {message}")]
    ScriptParse { line: usize, message: String },

    // Dispatcher errors
    #[error("Dispatcher channel closed")]
    ChannelClosed,
}

/// Result type alias for guestnet operations
pub type Result<T> = std::result::Result<T, Error>;
