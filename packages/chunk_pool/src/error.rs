use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Errors returned by allocation requests that the pool refuses to satisfy.
///
/// A refused request leaves the pool exactly as it was before the call.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum AllocationError {
    /// The caller asked for more contiguous entries than a single chunk can hold.
    #[error(
        "cannot allocate a block of {requested} contiguous entries from chunks of {capacity} entries"
    )]
    BlockTooLarge {
        /// The number of entries the caller asked for.
        requested: usize,

        /// The maximum number of entries a chunk of the pool can hold.
        capacity: usize,
    },

    /// The caller asked for a block of zero entries.
    #[error("cannot allocate a block of zero entries")]
    EmptyBlock,
}

/// A specialized `Result` type for pool allocation, returning the crate's
/// [`AllocationError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, AllocationError>;

/// Describes a broken pool contract, such as a double free or a pointer handed to the wrong pool.
///
/// Violations are never returned to the caller. They are logged and then raised as a panic whose
/// message is the `Display` form of this type, so the value is mostly useful for inspecting
/// panic payloads in tests and custom panic hooks.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("pool invariant violated at {location}: {message} (failed check: `{condition}`)")]
pub struct InvariantViolation {
    condition: &'static str,
    location: String,
    message: String,
}

impl InvariantViolation {
    pub(crate) fn new(
        condition: &'static str,
        location: &Location<'_>,
        message: fmt::Arguments<'_>,
    ) -> Self {
        Self {
            condition,
            location: location.to_string(),
            message: message.to_string(),
        }
    }

    /// The source text of the check that failed.
    #[must_use]
    pub fn condition(&self) -> &'static str {
        self.condition
    }

    /// The `file:line:column` where the check is located.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// A human-readable description of what went wrong.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}
