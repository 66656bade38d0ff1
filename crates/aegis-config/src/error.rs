use std::fmt;

/// Configuration loading/parsing failures. Invalid or missing configuration
/// is fatal at boot (`aegis-cli` exits with code 10 on this error).
#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Yaml { path: String, message: String },
    Json { message: String },
    MissingField(String),
    InvalidValue { field: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "read config {path}: {source}"),
            ConfigError::Yaml { path, message } => write!(f, "parse yaml {path}: {message}"),
            ConfigError::Json { message } => write!(f, "canonical json parse failed: {message}"),
            ConfigError::MissingField(field) => write!(f, "missing config field: {field}"),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid config field {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
