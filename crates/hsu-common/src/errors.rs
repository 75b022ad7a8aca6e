//! Error types for the HSU name server.
//!
//! # Rust Learning Note
//!
//! Rust doesn't have exceptions - it uses `Result<T, E>` for error handling.
//! Every fallible operation in the name server returns [`Result<T>`], and the
//! caller decides whether the failure is recoverable (answer the client with
//! an error reply) or fatal (stop the worker).
//!
//! ```rust
//! use hsu_common::{Error, Result};
//!
//! fn lookup(name: &str) -> Result<String> {
//!     Err(Error::not_found(name))
//! }
//!
//! fn caller() -> Result<()> {
//!     // `?` propagates the error to our caller
//!     let _address = lookup("svc-a")?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for name server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the name server.
///
/// The variants follow the recovery policy of the request loop:
/// `Protocol`, `Validation` and `NotFound` are answered with an error reply,
/// `Transport` is fatal to the worker that hit it.
///
/// # Rust Learning Note
///
/// The enum is `Clone` so the server can hand the same error to the caller of
/// `start()` and keep a copy for later `last_error()` queries. That is why
/// `Transport` stores the rendered I/O error instead of `std::io::Error`
/// (which is not `Clone`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Unparseable or non-conforming request, including unknown commands.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A required request field is missing or invalid.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
    },

    /// A requested name is not registered.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
    },

    /// Bind, accept, send or receive failure on an underlying channel.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
    },

    /// A transport address could not be parsed.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        address: String,
        reason: String,
    },

    /// Internal error (shouldn't happen in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error with added context.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a NotFound error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a Transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: cause.to_string(),
        }
    }

    /// Creates an InvalidAddress error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Adds context to an error.
    ///
    /// # Example
    /// ```
    /// use hsu_common::{Error, Result};
    ///
    /// fn bind() -> Result<()> {
    ///     Err(Error::transport("address in use"))
    /// }
    ///
    /// fn start() -> Result<()> {
    ///     bind().map_err(|e| e.context("Failed to bind request transport"))
    /// }
    /// ```
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::WithContext {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if this error (ignoring context) is fatal to a transport worker.
    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Error::Transport { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err)
    }
}

// Convenience methods for Result types
pub trait ResultExt<T> {
    /// Adds context to an error result.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(message))
    }
}
