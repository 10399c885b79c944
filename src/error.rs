//! Error handling for watchlink-rs
//!
//! This module defines the crate error type and a Result alias used
//! throughout the synchronization core. Errors are grouped by the layer
//! that raises them so callers can tell "don't know" (e.g. [`WatchError::Timeout`])
//! apart from "know it failed" (e.g. [`WatchError::OperationFailure`]).

use thiserror::Error;

/// Main error type for watchlink-rs operations
#[derive(Error, Debug)]
pub enum WatchError {
    /// A variable type has no decode/encode rule
    #[error("Decoding of type {type_name} is not implemented")]
    NotImplemented { type_name: String },

    /// Not enough bytes to decode a value
    #[error("Buffer too small for {type_name}: need {needed} bytes, got {got}")]
    BufferTooSmall {
        type_name: String,
        needed: usize,
        got: usize,
    },

    /// Malformed fully qualified name
    #[error("Invalid fully qualified name \"{0}\"")]
    InvalidFqn(String),

    /// Invalid registry path (empty, root)
    #[error("Bad path: {0}")]
    BadPath(String),

    /// A path segment does not exist in the registry
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A leaf already exists at that path for that type
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// A watcher with that id is already registered
    #[error("A watcher with ID {0} is already registered")]
    DuplicateWatcher(String),

    /// No watcher with that id is registered
    #[error("No watcher with ID {0}")]
    WatcherNotFound(String),

    /// Watch/unwatch targeted a folder rather than a leaf
    #[error("Cannot watch a folder: {0}")]
    NotAWatchable(String),

    /// Alias definition failed validation
    #[error("Invalid alias {fullpath}: {message}")]
    InvalidAlias { fullpath: String, message: String },

    /// Alias target could not be classified as a variable or an RPV
    #[error("Cannot resolve alias target \"{0}\"")]
    UnresolvedAliasTarget(String),

    /// Value rejected by an alias range
    #[error("Value {value} is outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// Write did not resolve before the caller's deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Write resolved unsuccessfully
    #[error("Operation failed: {0}")]
    OperationFailure(String),

    /// Listener setup failed, start was aborted
    #[error("Listener setup failed: {0}")]
    ListenerSetup(String),

    /// Listener used in the wrong state (e.g. subscribe while running)
    #[error("Listener error: {0}")]
    ListenerState(String),

    /// Link configuration is invalid. Every problem found is listed.
    #[error("Invalid configuration for {link} link: {}", problems.join("; "))]
    InvalidLinkConfig { link: String, problems: Vec<String> },

    /// Unknown transport name
    #[error("Unknown link type \"{0}\"")]
    UnknownLink(String),

    /// Link is not usable
    #[error("Link error: {0}")]
    LinkIo(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to probe operations
    #[error("Probe error: {0}")]
    Probe(#[from] probe_rs::Error),

    /// Errors related to debug probe operations
    #[error("Debug probe error: {0}")]
    DebugProbe(#[from] probe_rs::probe::DebugProbeError),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<WatchError>,
    },
}

impl WatchError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        WatchError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context layers and return the underlying error
    pub fn root(&self) -> &WatchError {
        match self {
            WatchError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors that mean "the outcome is unknown"
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), WatchError::Timeout(_))
    }
}

/// Result type alias for watchlink-rs operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
