//! Error types for the cutflow toolkit.

use thiserror::Error;

/// Cutflow error type.
#[derive(Error, Debug)]
pub enum Error {
    /// A process or distribution was registered twice under the same key.
    #[error("{kind} '{name}' defined twice")]
    DuplicateName {
        /// What was registered ("process", "distribution", ...).
        kind: &'static str,
        /// The offending key.
        name: String,
    },

    /// A combined process references itself through its subprocess graph.
    #[error("cyclic process definition involving '{0}'")]
    CyclicDefinition(String),

    /// A process, histogram, or backing data source is missing.
    ///
    /// Recoverable: callers skip the offending key and log it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The persisted cutflow table cannot be read back on resume.
    #[error("cannot resume: {0}")]
    StaleResume(String),

    /// Expression compilation or evaluation error.
    #[error("expression error: {0}")]
    Expression(String),

    /// Invalid analysis configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the caller may skip the offending item and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
