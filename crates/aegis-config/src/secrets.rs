//! Secret values that must never appear in the canonicalized/hashed config
//! document, nor in any `Debug`/`Display` output — operator confirmation
//! tokens and live exchange API credentials.

use std::fmt;

use crate::ConfigError;

/// Wraps a secret value with a redacted `Debug` impl. `T` is never exposed
/// except through [`Secret::expose`], so accidental `tracing`/`println!`
/// logging of a struct containing a `Secret` cannot leak it.
#[derive(Clone)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Secret(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***REDACTED***)")
    }
}

impl<T: PartialEq> PartialEq for Secret<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// The operator-registered confirmation token required for a PAPER -> LIVE
/// mode switch (§4.7, §6 exit code 30).
#[derive(Clone, Debug)]
pub struct OperatorSecrets {
    pub confirmation_token: Secret<String>,
}

/// Credentials for the live exchange adapter's request signing.
#[derive(Clone, Debug)]
pub struct LiveExchangeSecrets {
    pub api_key: Secret<String>,
    pub api_secret: Secret<String>,
}

const ENV_OPERATOR_TOKEN: &str = "AEGIS_OPERATOR_TOKEN";
const ENV_LIVE_API_KEY: &str = "AEGIS_LIVE_API_KEY";
const ENV_LIVE_API_SECRET: &str = "AEGIS_LIVE_API_SECRET";

/// Load the operator confirmation token from the environment. Its absence
/// is not fatal at boot in PAPER mode; `aegis-cli` treats it as fatal
/// (exit code 30) only when a LIVE boot is requested.
pub fn load_operator_secrets() -> Result<OperatorSecrets, ConfigError> {
    let token = std::env::var(ENV_OPERATOR_TOKEN)
        .map_err(|_| ConfigError::MissingField(ENV_OPERATOR_TOKEN.to_string()))?;
    Ok(OperatorSecrets {
        confirmation_token: Secret::new(token),
    })
}

/// Load live exchange credentials from the environment. Required only when
/// the live backend is actually instantiated.
pub fn load_live_exchange_secrets() -> Result<LiveExchangeSecrets, ConfigError> {
    let api_key = std::env::var(ENV_LIVE_API_KEY)
        .map_err(|_| ConfigError::MissingField(ENV_LIVE_API_KEY.to_string()))?;
    let api_secret = std::env::var(ENV_LIVE_API_SECRET)
        .map_err(|_| ConfigError::MissingField(ENV_LIVE_API_SECRET.to_string()))?;
    Ok(LiveExchangeSecrets {
        api_key: Secret::new(api_key),
        api_secret: Secret::new(api_secret),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("super-secret-token".to_string());
        let rendered = format!("{s:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn secret_expose_returns_inner_value() {
        let s = Secret::new(42);
        assert_eq!(*s.expose(), 42);
    }
}
