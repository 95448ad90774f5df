//! Settlement engine configuration.

use std::time::Duration;

/// How deposit requests reach the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositMode {
    /// Request records a pending deposit; the confirmation link credits it.
    TwoStep,
    /// Request credits and confirms before returning.
    Immediate,
}

impl DepositMode {
    /// Parse the `DEPOSIT_MODE` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two-step" | "two_step" | "twostep" => Some(DepositMode::TwoStep),
            "immediate" => Some(DepositMode::Immediate),
            _ => None,
        }
    }
}

/// Settlement processing configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Hold before a withdrawal is settled (verification window).
    pub verification_delay: Duration,
    /// Upper bound on one settlement attempt.
    pub settlement_timeout: Duration,
    /// Maximum settlements executing at once.
    pub max_concurrent_settlements: usize,
    /// How long shutdown waits for in-flight settlements.
    pub drain_timeout: Duration,
    /// Deposit confirmation flow.
    pub deposit_mode: DepositMode,
    /// Prefix of the deposit confirmation link.
    pub confirmation_base_url: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            verification_delay: Duration::from_secs(5),
            settlement_timeout: Duration::from_secs(30),
            max_concurrent_settlements: 1024,
            drain_timeout: Duration::from_secs(30),
            deposit_mode: DepositMode::TwoStep,
            confirmation_base_url: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Postgres URL; `None` selects the in-memory backend.
    pub database_url: Option<String>,
    /// Connection pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Settlement configuration.
    pub settlement: SettlementConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settlement: SettlementConfig::default(),
            storage: StorageConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = lookup("SETTLEMENT_VERIFICATION_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.settlement.verification_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = lookup("SETTLEMENT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.settlement.settlement_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = lookup("SETTLEMENT_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            config.settlement.max_concurrent_settlements = n;
        }

        if let Some(mode) = lookup("DEPOSIT_MODE").and_then(|v| DepositMode::parse(&v)) {
            config.settlement.deposit_mode = mode;
        }

        if let Some(url) = lookup("CONFIRMATION_BASE_URL") {
            config.settlement.confirmation_base_url = url;
        }

        config.storage.database_url = lookup("DATABASE_URL").or_else(|| postgres_url(&lookup));

        if let Some(n) = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.storage.max_connections = n;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.settlement.max_concurrent_settlements == 0 {
            return Err("Max concurrent settlements cannot be 0".to_string());
        }

        if self.settlement.settlement_timeout.is_zero() {
            return Err("Settlement timeout cannot be 0".to_string());
        }

        if self.settlement.confirmation_base_url.trim().is_empty() {
            return Err("Confirmation base URL cannot be empty".to_string());
        }

        if let Some(url) = &self.storage.database_url {
            if url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.storage.max_connections == 0 {
                return Err("Max connections cannot be 0".to_string());
            }
        }

        Ok(())
    }
}

/// Assemble a URL from the discrete `POSTGRES_*` settings, if a host is given.
fn postgres_url<F>(lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let host = lookup("POSTGRES_HOST")?;
    let port = lookup("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
    let user = lookup("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string());
    let db = lookup("POSTGRES_DB").unwrap_or_else(|| "penny".to_string());

    let credentials = match lookup("POSTGRES_PASSWORD") {
        Some(password) => format!("{}:{}", user, password),
        None => user,
    };

    Some(format!("postgres://{}@{}:{}/{}", credentials, host, port, db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.settlement.deposit_mode, DepositMode::TwoStep);
        assert!(config.storage.database_url.is_none());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = EngineConfig::default();
        config.settlement.max_concurrent_settlements = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.storage.database_url = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("SETTLEMENT_VERIFICATION_DELAY_MS", "250"),
            ("SETTLEMENT_MAX_CONCURRENT", "8"),
            ("DEPOSIT_MODE", "immediate"),
            ("CONFIRMATION_BASE_URL", "https://pay.example.test/confirm"),
            ("LOG_LEVEL", "debug"),
        ]));

        assert_eq!(config.settlement.verification_delay, Duration::from_millis(250));
        assert_eq!(config.settlement.max_concurrent_settlements, 8);
        assert_eq!(config.settlement.deposit_mode, DepositMode::Immediate);
        assert_eq!(
            config.settlement.confirmation_base_url,
            "https://pay.example.test/confirm"
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_postgres_url_from_parts() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("POSTGRES_HOST", "db"),
            ("POSTGRES_USER", "ledger"),
            ("POSTGRES_PASSWORD", "secret"),
            ("POSTGRES_DB", "balances"),
        ]));

        assert_eq!(
            config.storage.database_url.as_deref(),
            Some("postgres://ledger:secret@db:5432/balances")
        );
    }

    #[test]
    fn test_database_url_wins() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/penny"),
            ("POSTGRES_HOST", "ignored"),
        ]));

        assert_eq!(
            config.storage.database_url.as_deref(),
            Some("postgres://localhost/penny")
        );
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("SETTLEMENT_TIMEOUT_MS", "soon"),
            ("DEPOSIT_MODE", "sometimes"),
        ]));

        assert_eq!(config.settlement.settlement_timeout, Duration::from_secs(30));
        assert_eq!(config.settlement.deposit_mode, DepositMode::TwoStep);
    }
}
