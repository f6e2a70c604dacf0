//! Discovery configuration: TOML parsing, defaults, and validation.
//!
//! Every field is optional in the file; anything omitted takes the default.
//!
//! ```toml
//! chunk_size = 100
//! time_limit_ms = 3000
//! max_attempts = 10
//! sieve_namespace = "sieve"
//! prime_namespace = "prime"
//! ```

use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 100;
pub const DEFAULT_TIME_LIMIT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Initial pool range (`2..chunk_size`) and the cap on one growth step.
    pub chunk_size: u64,
    /// Soft wall-clock budget for one `discover_prime` call.
    pub time_limit_ms: u64,
    /// Attempt ceiling for each optimistic-concurrency operation.
    pub max_attempts: u32,
    /// Entity group holding sieve candidates.
    pub sieve_namespace: String,
    /// Entity group holding prime records.
    pub prime_namespace: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sieve_namespace: "sieve".to_string(),
            prime_namespace: "prime".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    /// Check the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        // The initial range must contain at least one candidate.
        if self.chunk_size < 3 {
            anyhow::bail!("chunk_size must be at least 3 (got {})", self.chunk_size);
        }
        if self.time_limit_ms == 0 {
            anyhow::bail!("time_limit_ms must be positive");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be positive");
        }
        for (field, value) in [
            ("sieve_namespace", &self.sieve_namespace),
            ("prime_namespace", &self.prime_namespace),
        ] {
            if value.is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
        }
        if self.sieve_namespace == self.prime_namespace {
            anyhow::bail!(
                "sieve_namespace and prime_namespace must differ (both '{}')",
                self.sieve_namespace
            );
        }
        Ok(())
    }
}

/// Parse a discovery configuration from a TOML string.
pub fn parse_toml(content: &str) -> Result<DiscoveryConfig> {
    let config: DiscoveryConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Parse a discovery configuration from a TOML file path.
pub fn parse_toml_file(path: &std::path::Path) -> Result<DiscoveryConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_toml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_toml("").unwrap();
        assert_eq!(config, DiscoveryConfig::default());
        assert_eq!(config.time_limit(), Duration::from_secs(3));
        assert_eq!(config.retry_policy().max_attempts(), 10);
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let config = parse_toml("chunk_size = 500\nprime_namespace = \"primes-eu\"\n").unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.prime_namespace, "primes-eu");
        assert_eq!(config.time_limit_ms, DEFAULT_TIME_LIMIT_MS);
    }

    #[test]
    fn rejects_degenerate_values() {
        assert!(parse_toml("chunk_size = 2").is_err());
        assert!(parse_toml("time_limit_ms = 0").is_err());
        assert!(parse_toml("max_attempts = 0").is_err());
        assert!(parse_toml("sieve_namespace = \"\"").is_err());
        assert!(parse_toml("sieve_namespace = \"prime\"").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = parse_toml("chunk = 100").unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{}", err);
    }

    #[test]
    fn parses_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time_limit_ms = 250").unwrap();
        let config = parse_toml_file(file.path()).unwrap();
        assert_eq!(config.time_limit(), Duration::from_millis(250));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse_toml_file(std::path::Path::new("/nonexistent/primeshare.toml")).is_err());
    }
}
