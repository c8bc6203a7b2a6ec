//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The ID contains a character outside the permitted set.
    #[error("invalid character {ch:?} in {kind} {value:?}")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        ch: char,
    },

    /// The ID exceeds the maximum length.
    #[error("{kind} exceeds {max} characters")]
    TooLong { kind: &'static str, max: usize },

    /// A namespaced pod name was not in `namespace/name` form.
    #[error("invalid namespaced pod name: {0:?}")]
    InvalidPodName(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
