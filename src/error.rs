//! Error handling for the sensor fleet
//!
//! This module defines the error taxonomy shared by transports, ingestion
//! loops and sinks, plus a Result alias for use throughout the crate.
//!
//! # Classification
//!
//! - Per-message errors ([`FleetError::MalformedMessage`]) are local to one
//!   channel: the reader logs and skips them.
//! - End-of-channel errors ([`FleetError::Transport`],
//!   [`FleetError::ConnectionClosed`], [`FleetError::ShutdownRace`]) finish one
//!   channel but never its siblings.
//! - Resource acquisition errors ([`FleetError::ResourceBusy`],
//!   [`FleetError::Config`]) are fatal at startup.

use std::io;
use thiserror::Error;

/// Main error type for sensor fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// Bytes received from a peer could not be decoded into a message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Abrupt peer failure (reset, broken pipe, truncated frame)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer went away gracefully
    #[error("Connection closed")]
    ConnectionClosed,

    /// Address or region already held by a non-cooperating owner
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// A resource was closed while another unit was blocked on it
    #[error("Shutdown race: {0}")]
    ShutdownRace(String),

    /// One or more sinks failed to accept a message
    #[error("Sink error: {0}")]
    Sink(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FleetError>,
    },
}

impl FleetError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FleetError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &FleetError {
        match self {
            FleetError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the error ends one channel: graceful close, abrupt peer
    /// failure, or a close observed during the shutdown window.
    pub fn is_end_of_channel(&self) -> bool {
        matches!(
            self.root(),
            FleetError::ConnectionClosed | FleetError::Transport(_) | FleetError::ShutdownRace(_)
        )
    }

    /// True for errors that are expected while the fleet shuts down and must
    /// not be reported above debug level.
    pub fn is_shutdown_expected(&self) -> bool {
        matches!(
            self.root(),
            FleetError::ConnectionClosed | FleetError::ShutdownRace(_)
        )
    }

    /// True for startup errors that must propagate to the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            FleetError::ResourceBusy(_) | FleetError::Config(_)
        )
    }
}

impl From<io::Error> for FleetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => FleetError::Transport(err.to_string()),
            io::ErrorKind::AddrInUse => FleetError::ResourceBusy(err.to_string()),
            _ => FleetError::Io(err),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

/// Result type alias for sensor fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

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

impl<T> ResultExt<T> for std::result::Result<T, io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| FleetError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FleetError::from(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::MalformedMessage("missing field `id`".to_string());
        assert_eq!(err.to_string(), "Malformed message: missing field `id`");
    }

    #[test]
    fn test_error_with_context() {
        let err = FleetError::ConnectionClosed;
        let with_ctx = err.with_context("reader for Load");
        assert!(with_ctx.to_string().contains("reader for Load"));
        assert!(with_ctx.is_end_of_channel());
        assert!(with_ctx.is_shutdown_expected());
    }

    #[test]
    fn test_io_error_classification() {
        let reset: FleetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, FleetError::Transport(_)));
        assert!(reset.is_end_of_channel());
        assert!(!reset.is_shutdown_expected());

        let busy: FleetError = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(busy.is_fatal());

        let other: FleetError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, FleetError::Io(_)));
    }

    #[test]
    fn test_malformed_is_not_end_of_channel() {
        let err = FleetError::MalformedMessage("bad".into());
        assert!(!err.is_end_of_channel());
        assert!(!err.is_fatal());
    }
}
