use std::fmt;

/// Durable-store failures. Unavailability at boot is fatal (`aegis-cli`
/// exits with code 20); failures during normal operation propagate to the
/// caller as a structured cause, per the error handling design (§7).
#[derive(Debug)]
pub enum DbError {
    MissingEnvVar(&'static str),
    Connect(sqlx::Error),
    Migrate(sqlx::migrate::MigrateError),
    Query { context: &'static str, source: sqlx::Error },
    Serialize(serde_json::Error),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::MissingEnvVar(name) => write!(f, "missing env var {name}"),
            DbError::Connect(e) => write!(f, "connect to durable store: {e}"),
            DbError::Migrate(e) => write!(f, "apply migrations: {e}"),
            DbError::Query { context, source } => write!(f, "{context}: {source}"),
            DbError::Serialize(e) => write!(f, "serialize durable record: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialize(e)
    }
}
