use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

/// Beta-side records wait this many alpha windows before alpha is reported
pub const DEFAULT_BETA_TIMEOUT_MULTIPLIER: i32 = 3;

/// Gas limits used to price each kind of transaction the engine submits
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct GasLimits {
    pub eth_transfer: u64,
    pub prl_transfer: u64,
    pub bury: u64,
    pub claim: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            eth_transfer: 21_000,
            prl_transfer: 60_000,
            bury: 70_000,
            claim: 90_000,
        }
    }
}

/// Per-family polling schedule
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct JobSchedule {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl JobSchedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Unset runs against in-memory stores
    pub database_url: Option<String>,
    pub bind_address: String,
    pub ledger_url: String,
    pub ledger_timeout_secs: u64,
    pub main_wallet_address: String,
    pub main_wallet_encrypted_key: String,
    pub key_vault_secret: String,
    pub tx_timeout_secs: i64,
    pub beta_timeout_multiplier: i32,
    pub confirmation_concurrency: usize,
    pub gas_limits: GasLimits,
    pub payment: JobSchedule,
    pub burial: JobSchedule,
    pub claim: JobSchedule,
    pub legacy_reclaim: JobSchedule,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            ledger_url: std::env::var("LEDGER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            ledger_timeout_secs: env_or("LEDGER_TIMEOUT_SECS", 30)?,
            main_wallet_address: required("MAIN_WALLET_ADDRESS")?,
            main_wallet_encrypted_key: required("MAIN_WALLET_ENCRYPTED_KEY")?,
            key_vault_secret: required("KEY_VAULT_SECRET")?,
            tx_timeout_secs: env_or("SETTLEMENT_TX_TIMEOUT_SECS", 3600)?,
            beta_timeout_multiplier: env_or("BETA_TIMEOUT_MULTIPLIER", DEFAULT_BETA_TIMEOUT_MULTIPLIER)?,
            confirmation_concurrency: env_or("CONFIRMATION_CONCURRENCY", 8)?,
            gas_limits: GasLimits {
                eth_transfer: env_or("GAS_LIMIT_ETH_TRANSFER", 21_000)?,
                prl_transfer: env_or("GAS_LIMIT_PRL_TRANSFER", 60_000)?,
                bury: env_or("GAS_LIMIT_BURY", 70_000)?,
                claim: env_or("GAS_LIMIT_CLAIM", 90_000)?,
            },
            payment: schedule("PAYMENT", 60)?,
            burial: schedule("BURIAL", 60)?,
            claim: schedule("CLAIM", 60)?,
            legacy_reclaim: schedule("LEGACY_RECLAIM", 300)?,
        })
    }

    /// Timeout window applied to alpha-side and treasure transactions
    pub fn tx_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tx_timeout_secs)
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::NotFound(key.to_string()))
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Message(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn schedule(prefix: &str, default_secs: u64) -> Result<JobSchedule, ConfigError> {
    Ok(JobSchedule {
        enabled: env_or(&format!("{}_ENABLED", prefix), true)?,
        interval_secs: env_or(&format!("{}_POLL_SECS", prefix), default_secs)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_parses_and_defaults() {
        std::env::set_var("BROKER_TEST_ENV_OR_OK", " 42 ");
        std::env::set_var("BROKER_TEST_ENV_OR_BAD", "forty-two");

        assert_eq!(env_or::<u64>("BROKER_TEST_ENV_OR_OK", 7).unwrap(), 42);
        assert_eq!(env_or::<u64>("BROKER_TEST_ENV_OR_MISSING", 7).unwrap(), 7);
        assert!(env_or::<u64>("BROKER_TEST_ENV_OR_BAD", 7).is_err());
    }

    #[test]
    fn test_schedule_interval_never_zero() {
        let schedule = JobSchedule { enabled: true, interval_secs: 0 };
        assert_eq!(schedule.interval(), Duration::from_secs(1));
    }
}
