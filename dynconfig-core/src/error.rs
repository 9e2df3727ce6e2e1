//! Error types for the dynamic configuration engine.
//!
//! Only three kinds of failure matter to callers:
//!
//! - [`Error::InvalidAccess`]: a plugin wrote a different value into a
//!   read-only field. This is a programming mistake and is always returned.
//! - [`Error::Conversion`]: a value could not be instrumented. Nested values
//!   recover from this locally; the error only escapes from explicit calls.
//! - [`Error::SealedRoot`]: the root object handed to
//!   [`create_dynamic_config`](crate::create_dynamic_config) cannot be
//!   converted in place. Retry with `in_place = false`.
//!
//! The remaining variants describe misuse of the value tree itself.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the dynamic configuration engine.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Write of a different value into a read-only field.
    #[error("invalid access to \"{field}\": {message}")]
    InvalidAccess {
        /// Name of the field that rejected the write.
        field: String,
        /// Human readable reason.
        message: String,
    },

    /// Interception could not be installed on a value.
    #[error("dynamic conversion failed: {0}")]
    Conversion(String),

    /// The root object is sealed or frozen and cannot be converted in place.
    #[error("cannot convert sealed root in place: {0}")]
    SealedRoot(String),

    /// Write to a field of a frozen or sealed node.
    #[error("cannot modify \"{field}\": object is not extensible")]
    Frozen {
        /// Name of the field that rejected the write.
        field: String,
    },

    /// Array nodes only accept decimal index keys.
    #[error("invalid array index: {key}")]
    InvalidKey {
        /// The offending key.
        key: String,
    },

    /// The raw configuration is not an object.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The value is not tracked by any live handler.
    #[error("value is not a dynamic configuration")]
    NotDynamic,

    /// One or more listeners failed during a flush.
    #[error("{} listener(s) failed: {}", .0.len(), join_errors(.0))]
    Listeners(Vec<Error>),
}

impl Error {
    /// Build an [`Error::InvalidAccess`] for a read-only field.
    pub fn read_only(field: impl Into<String>) -> Self {
        Self::InvalidAccess {
            field: field.into(),
            message: "field is read-only".to_string(),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
