use thiserror::Error;

/// Top-level error type for the Foreman system.
///
/// Subsystem crates define their own error enums and wrap this one with
/// `#[from]` so the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ForemanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ForemanError {
    /// Whether this error should stop the process before any work begins.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForemanError::Config(_))
    }
}

impl From<toml::de::Error> for ForemanError {
    fn from(err: toml::de::Error) -> Self {
        ForemanError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ForemanError {
    fn from(err: toml::ser::Error) -> Self {
        ForemanError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ForemanError {
    fn from(err: serde_json::Error) -> Self {
        ForemanError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Foreman operations.
pub type Result<T> = std::result::Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ForemanError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(ForemanError, &str)> = vec![
            (
                ForemanError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                ForemanError::Validation("empty plan".to_string()),
                "Validation error: empty plan",
            ),
            (
                ForemanError::Concurrency("lock held".to_string()),
                "Concurrency conflict: lock held",
            ),
            (
                ForemanError::NotFound("inbox/a.md".to_string()),
                "Not found: inbox/a.md",
            ),
            (
                ForemanError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(ForemanError::Config("bad".into()).is_fatal());
        assert!(!ForemanError::Storage("bad".into()).is_fatal());
        assert!(!ForemanError::Validation("bad".into()).is_fatal());
        assert!(!ForemanError::Concurrency("bad".into()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ForemanError = io_err.into();
        assert!(matches!(err, ForemanError::Io(_)));
        assert!(err.to_string().starts_with("I/O error:"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let foreman_err: ForemanError = err.unwrap_err().into();
        assert!(matches!(foreman_err, ForemanError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let foreman_err: ForemanError = err.unwrap_err().into();
        assert!(matches!(foreman_err, ForemanError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
