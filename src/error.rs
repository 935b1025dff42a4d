//! Error types and error handling strategy for Ringdown.
//!
//! This module defines the core error type used throughout the server.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Loader failures are per-instance and recoverable; they are logged and
//!   skipped, never fatal to the process
//! - Failures that cross the wire are converted to tagged values at the
//!   action layer (see [`crate::action::ActionResult`])

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // === Locality / state machine ===
    /// Operation invoked on the wrong locality or in the wrong runtime phase.
    InvalidStatus,

    // === Plugin registry ===
    /// Plugin instance name unknown, disabled, or the factory cast failed.
    BadPluginType,
    /// A second plugin section claimed an already-registered instance name.
    DuplicatePluginName,
    /// A statically linked build was asked to load dynamically, or vice versa.
    ServiceUnavailable,

    // === Configuration / command line ===
    /// Secondary command-line validation failed.
    CommandLineOptionError,
    /// Malformed configuration text or a missing mandatory entry.
    InvalidConfig,

    // === Internal ===
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for Ringdown operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error marks a wrong-locality or wrong-phase call.
    #[must_use]
    pub const fn is_invalid_status(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidStatus)
    }

    /// Returns true if this error came from the plugin registry.
    #[must_use]
    pub const fn is_plugin_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::BadPluginType | ErrorKind::DuplicatePluginName
        )
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the context text, if any was attached.
    #[must_use]
    pub fn context_str(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Ringdown operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::InvalidStatus);
        assert_eq!(err.to_string(), "InvalidStatus");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::BadPluginType).with_context("no such plugin: parquet");
        assert_eq!(err.to_string(), "BadPluginType: no such plugin: parquet");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::InvalidConfig)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        let status = Error::new(ErrorKind::InvalidStatus);
        assert!(status.is_invalid_status());
        assert!(!status.is_plugin_error());

        let dup = Error::new(ErrorKind::DuplicatePluginName);
        assert!(dup.is_plugin_error());
        assert!(!dup.is_invalid_status());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::Internal));
        let err = res.context("registry lookup").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal: registry lookup");
    }
}
