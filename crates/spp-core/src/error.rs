//! Error taxonomy for SPP evaluation.

use spp_cache::CacheError;

/// Errors produced while parsing templates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {offset}")]
    UnclosedPlaceholder { offset: usize },

    #[error("empty placeholder at byte {offset}")]
    EmptyPlaceholder { offset: usize },
}

/// SPP errors.
#[derive(Debug, thiserror::Error)]
pub enum SppError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("missing variable: {name}")]
    MissingVariable { name: String },

    #[error("extractor {extractor} failed: {reason}")]
    Extraction { extractor: String, reason: String },

    #[error("unknown lambda extractor: {0}")]
    UnknownLambda(String),

    #[error("Minibatch results do not have right length: expected {expected}, got {got}")]
    MinibatchLength { expected: usize, got: usize },

    #[error("expected a list from {node}, found {found}")]
    NotAList { node: String, found: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for SPP operations.
pub type Result<T> = std::result::Result<T, SppError>;

/// A failure confined to one row (or one lane of a `for_each`).
///
/// Rows fail this way only under `on_error = null`; the message is what ends
/// up in the table's error column.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RowError {
    pub message: String,
}

impl RowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&SppError> for RowError {
    fn from(err: &SppError) -> Self {
        RowError::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minibatch_length_message() {
        let err = SppError::MinibatchLength {
            expected: 5,
            got: 3,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Minibatch results do not have right length"));
        assert!(msg.contains("expected 5"));
        assert!(msg.contains("got 3"));
    }

    #[test]
    fn template_error_converts() {
        let err: SppError = TemplateError::UnclosedPlaceholder { offset: 4 }.into();
        assert!(err.to_string().contains("byte 4"));
    }

    #[test]
    fn row_error_from_spp_error() {
        let err = SppError::Backend("rate limited".to_string());
        let row = RowError::from(&err);
        assert_eq!(row.message, "backend error: rate limited");
    }
}
