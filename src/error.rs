//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be built or deserialized
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A rule's regular expression failed to compile
    #[error("Invalid pattern in rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// A rule definition is structurally invalid
    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// A user-keyed rule matched a request with no authenticated identity.
    ///
    /// The caller decides whether to reject the request or let it through.
    #[error("Rule '{rule}' is keyed by user id but the request carries no identity")]
    MissingIdentity { rule: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
