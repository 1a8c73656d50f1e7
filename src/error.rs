use thiserror::Error;

/// Bad input handed to a builder or an unexpected reply shape from a node.
#[derive(Debug, Error)]
#[error("{message}{}", in_field(.field))]
pub struct ValidationError {
    pub message: String,
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// `Err` naming `field` unless `cond` holds.
    pub(crate) fn ensure(cond: bool, message: &str, field: &str) -> Result<(), ValidationError> {
        if cond {
            Ok(())
        } else {
            Err(Self::with_field(message, field))
        }
    }
}

fn in_field(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" in {f}"),
        None => String::new(),
    }
}

/// Every per-node error collected before a fan-out gave up.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MultiError {
    pub message: String,
    pub errors: Vec<Error>,
}

impl MultiError {
    pub fn new(errors: Vec<Error>) -> Self {
        let message = if errors.len() == 1 {
            "Failed due to error"
        } else {
            "Failed due to multiple errors"
        };

        Self {
            message: message.to_string(),
            errors,
        }
    }
}

#[derive(Debug, Error)]
#[error("{message} after {total_retry_attempts} retry attempt{}", plural(.total_retry_attempts))]
pub struct MaxRetryAttemptsError {
    pub message: String,
    pub total_retry_attempts: u32,
}

impl MaxRetryAttemptsError {
    pub fn new(message: impl Into<String>, total_retry_attempts: u32) -> Self {
        Self {
            message: message.into(),
            total_retry_attempts,
        }
    }
}

fn plural(n: &u32) -> &'static str {
    if *n == 1 { "" } else { "s" }
}

#[derive(Debug, Error)]
pub enum NodeError {
    /// The node has no cached script for the given hash (NOSCRIPT).
    #[error("NOSCRIPT {0}")]
    ScriptNotFound(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error(transparent)]
    MaxRetryAttempts(#[from] MaxRetryAttemptsError),

    #[error(transparent)]
    Node(#[from] NodeError),

    /// The node ran the script but refused the operation.
    #[error("{0}")]
    Rejected(String),
}

impl Error {
    pub fn is_max_retry_attempts(&self) -> bool {
        matches!(self, Error::MaxRetryAttempts(_))
    }

    /// Per-node errors when this is an aggregate, empty otherwise.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Multi(m) => &m.errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_names_field() {
        let e = ValidationError::with_field("Expected string", "resource_id");
        assert_eq!(e.to_string(), "Expected string in resource_id");
        assert_eq!(ValidationError::new("bad").to_string(), "bad");
    }

    #[test]
    fn max_retry_attempts_pluralizes() {
        assert_eq!(
            MaxRetryAttemptsError::new("Failed", 0).to_string(),
            "Failed after 0 retry attempts"
        );
        assert_eq!(
            MaxRetryAttemptsError::new("Failed", 1).to_string(),
            "Failed after 1 retry attempt"
        );
    }

    #[test]
    fn multi_error_message_depends_on_count() {
        let one = MultiError::new(vec![Error::Rejected("a".into())]);
        assert_eq!(one.to_string(), "Failed due to error");

        let two = MultiError::new(vec![
            Error::Rejected("a".into()),
            Error::Rejected("b".into()),
        ]);
        assert_eq!(two.to_string(), "Failed due to multiple errors");
        assert_eq!(Error::from(two).errors().len(), 2);
    }
}
