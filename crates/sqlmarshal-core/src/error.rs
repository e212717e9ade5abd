///
/// Error types shared by the codec and the engine bindings.
///
/// Binding and registration contract violations are raised before the
/// engine is touched. Engine failures carry the engine's own message and
/// extended result code.
///

use thiserror::Error;

use crate::value::StorageClass;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Engine error ({code}): {message}")]
    Engine { code: i32, message: String },

    #[error("Parameter count mismatch: statement expects {expected}, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("Placeholder {index} has no name and cannot be bound by name")]
    UnnamedPlaceholder { index: usize },

    #[error("No value supplied for parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Corrupt serialized value: {0}")]
    CorruptEnvelope(String),

    #[error("Value cannot be encoded: {0}")]
    UnsupportedValue(String),

    #[error("Invalid arity {requested} for function '{name}': engine allows at most {max}")]
    InvalidArity {
        name: String,
        requested: usize,
        max: usize,
    },

    #[error("Invalid function name {0:?}")]
    InvalidFunctionName(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: StorageClass,
    },

    #[error("Value of {0} bytes exceeds the engine's length limit")]
    TooBig(usize),

    #[error("{0}")]
    Function(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Error raised from inside a user-defined function body.
    pub fn function(message: impl Into<String>) -> Self {
        Error::Function(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::ArityMismatch {
            expected: 3,
            found: 2,
        };
        assert!(err.to_string().contains("expects 3"));
        assert!(err.to_string().contains("got 2"));

        let err = Error::MissingParameter {
            name: "b".to_string(),
        };
        assert!(err.to_string().contains("'b'"));

        let err = Error::InvalidArity {
            name: "wide".to_string(),
            requested: 500,
            max: 127,
        };
        assert!(err.to_string().contains("wide"));
        assert!(err.to_string().contains("127"));

        let err = Error::TypeMismatch {
            expected: "integer",
            found: StorageClass::Text,
        };
        assert_eq!(err.to_string(), "Type mismatch: expected integer, found text");

        let err = Error::function("negative input");
        assert_eq!(err.to_string(), "negative input");
    }

    #[test]
    fn test_toml_error_converts() {
        fn parse(content: &str) -> Result<toml::Table> {
            Ok(toml::from_str(content)?)
        }
        let err = parse("key = ").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
        assert!(err.to_string().starts_with("TOML parse error"));
    }
}
