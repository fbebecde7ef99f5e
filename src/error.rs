//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from buffer construction and
//! configuration issues to session lifecycle misuse and processor failures.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidCapacity`** / **`BackingStoreTooSmall`**: ring buffer construction errors.
//!   These are fatal and never coerced into a "nearby" valid capacity.
//! - **`Config`**: Wraps errors from `figment`, i.e. file parsing or merge problems.
//! - **`Configuration`**: Semantic errors in values that parsed correctly.
//! - **`Io`**: Wraps `std::io::Error` (disk dump output, thread spawning).
//! - **`InvalidState`**: A lifecycle operation was requested in a state that does not
//!   allow it, e.g. clearing the processor registry while the coordinator is running.
//! - **`Processor`**: A processor failed during `init`, `run` or `finish`. During
//!   acquisition this is reported as a diagnostic and never aborts the coordinator.
//! - **`Bridge`**: The foreign-runtime side of a bridged processor went away.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types with `?`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Ring buffer capacity is zero or not a power of two.
    #[error("Invalid ring buffer capacity {capacity}: must be a non-zero power of two")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },

    /// The supplied backing store holds fewer elements than the requested capacity.
    #[error("Backing store of {len} elements is smaller than capacity {capacity}")]
    BackingStoreTooSmall {
        /// Requested capacity.
        capacity: usize,
        /// Number of elements actually supplied.
        len: usize,
    },

    /// Configuration file parsing or merging failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle operation not allowed in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        state: String,
    },

    /// A processor failed.
    #[error("Processor '{name}' failed: {message}")]
    Processor {
        /// Processor name.
        name: String,
        /// Failure description (error chain or panic payload).
        message: String,
    },

    /// The coordinator thread could not be spawned or joined.
    #[error("Coordinator thread error: {0}")]
    ThreadSpawn(String),

    /// The remote end of a bridged processor is gone.
    #[error("Processor bridge error: {0}")]
    Bridge(String),

    /// No factory is registered under this processor type.
    #[error("Unknown processor type '{0}'")]
    UnknownProcessor(String),
}

impl DaqError {
    /// Whether the session can keep going after this error.
    ///
    /// Processor and bridge failures are isolated per iteration; everything else
    /// requires fixing configuration or restarting the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::Processor { .. } | DaqError::Bridge(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
