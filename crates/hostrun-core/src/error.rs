//! Payload validation errors

use thiserror::Error;

/// Errors raised while validating a request payload
///
/// All of these fire before any process or connection exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// A required payload field is absent or empty
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A payload field is present but has the wrong shape
    #[error("field '{field}' is invalid: expected {expected}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// What the field should have contained
        expected: &'static str,
    },

    /// The payload itself is not a mapping of fields
    #[error("payload must be a mapping of fields")]
    Payload,
}
