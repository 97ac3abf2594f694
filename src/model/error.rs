//! Errors raised by descriptor handlers.

/// Failure of a descriptor operation.
///
/// Cloneable so it can live in node flags, transaction records and error
/// notifications at the same time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("{0}")]
    Failed(String),

    /// Returned by `validate`; the value is never applied.
    #[error("invalid value: {message} (fields: {fields:?})")]
    InvalidValue { message: String, fields: Vec<String> },

    #[error("value type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: &'static str },

    #[error("descriptor {descriptor} does not support {operation}")]
    Unsupported { descriptor: String, operation: &'static str },

    #[error("value derived from {base} collides with a base value")]
    DerivedCollision { base: String },
}

impl DescriptorError {
    pub fn failed(message: impl Into<String>) -> Self {
        DescriptorError::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>, fields: &[&str]) -> Self {
        DescriptorError::InvalidValue {
            message: message.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Errors that no retry can fix, whatever the descriptor says.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, DescriptorError::Failed(_))
    }

    /// Fields reported by an [`DescriptorError::InvalidValue`].
    pub fn invalid_fields(&self) -> &[String] {
        match self {
            DescriptorError::InvalidValue { fields, .. } => fields,
            _ => &[],
        }
    }
}

pub type DescriptorResult<T> = std::result::Result<T, DescriptorError>;
