use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Violations are returned to the caller as descriptive values; the engine
/// never aborts the process over a bad configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Inconsistent configuration: {message}")]
    Inconsistent { message: String },

    #[error("Failed to read configuration file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },
}

impl ConfigurationError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn out_of_range(field: impl Into<String>, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent {
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
