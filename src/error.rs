//! Error types for the tracked allocator, its containers and the record
//! layer built on top of them.

use thiserror::Error;

/// Failure of a tracked allocation or of an operation that needs one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The platform allocator (or the configured byte budget) refused the
    /// request.
    #[error("resource exhausted: could not allocate {requested} bytes")]
    Exhausted { requested: usize },

    /// `requested` plus the block header (or a slot count times the slot
    /// width) does not fit in a `usize`.
    #[error("integer overflow computing allocation size for {requested} bytes")]
    Overflow { requested: usize },

    /// A handle that the allocator does not know about was used where a live
    /// block was required.
    #[error("block at {address:#x} is not registered with this allocator")]
    Unregistered { address: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("INVTRACK_BYTE_LIMIT must be a byte count, got {value:?}")]
    InvalidByteLimit { value: String },
}

/// A record line that could not be turned into a [`crate::record::Shoe`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} comma separated fields, got {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("field `{field}` is empty")]
    Empty { field: &'static str },

    #[error("field `{field}` is not a whole number: {value:?}")]
    NotANumber { field: &'static str, value: String },

    #[error("availability must be Y or N, got {value:?}")]
    Availability { value: String },
}
