//! Runtime configuration from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Postgres connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,

    /// Upper bound of the Postgres pool.
    pub max_connections: u32,

    /// How long a unit of work waits for its row locks.
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LEDGER_DATABASE_URL`: Postgres DSN (default: unset, in-memory store)
    /// - `LEDGER_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `LEDGER_LOCK_TIMEOUT_MS`: row lock wait in milliseconds (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("LEDGER_DATABASE_URL").filter(|url| !url.trim().is_empty());

        let max_connections = parse_or(&lookup, "LEDGER_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "LEDGER_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        let lock_timeout_ms = parse_or(&lookup, "LEDGER_LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS)?;

        Ok(Self {
            database_url,
            max_connections,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = config(&[
            ("LEDGER_DATABASE_URL", "postgres://localhost/ledger"),
            ("LEDGER_MAX_CONNECTIONS", "32"),
            ("LEDGER_LOCK_TIMEOUT_MS", " 250 "),
        ])
        .unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/ledger")
        );
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn blank_database_url_is_unset() {
        let config = config(&[("LEDGER_DATABASE_URL", "  ")]).unwrap();
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let err = config(&[("LEDGER_LOCK_TIMEOUT_MS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "LEDGER_LOCK_TIMEOUT_MS",
                value: "soon".to_string()
            }
        );
        assert!(config(&[("LEDGER_MAX_CONNECTIONS", "0")]).is_err());
        assert!(config(&[("LEDGER_MAX_CONNECTIONS", "-1")]).is_err());
    }
}
