use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// A required field is empty.
    #[error("`{0}` must not be empty")]
    EmptyField(String),
    /// Two entity blocks share the same name.
    #[error("entity `{0}` is configured more than once")]
    DuplicateEntity(String),
    /// Two pull blocks share the same name.
    #[error("pull `{0}` is configured more than once")]
    DuplicatePull(String),
}
