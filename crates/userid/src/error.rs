//! Error types for user ID resolution.
//!
//! Errors are reported through [`error_stack::Report`] so callers can attach
//! context as a failure travels from a storage slot or submodule up to the
//! engine. None of these errors ever escapes the bid decoration hook: the
//! engine logs them and resolves "no identifier" instead.

use derive_more::Display;

/// Failures raised while configuring or running the user ID engine.
#[derive(Debug, Display)]
pub enum UserIdError {
    /// A raw configuration entry could not be used.
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// The storage backend is unavailable or rejected an operation.
    #[display("Storage error: {message}")]
    Storage { message: String },

    /// A submodule failed while producing or decoding an identifier.
    #[display("Submodule {submodule} error: {message}")]
    Submodule { submodule: String, message: String },

    /// The host transport could not complete an identity provider call.
    #[display("Transport error: {message}")]
    Transport { message: String },

    /// A stored or fetched value had an unexpected shape.
    #[display("Invalid value: {message}")]
    InvalidValue { message: String },
}

impl core::error::Error for UserIdError {}

impl UserIdError {
    /// Shorthand for a [`UserIdError::Submodule`] error.
    pub fn submodule(submodule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Submodule {
            submodule: submodule.into(),
            message: message.into(),
        }
    }
}
