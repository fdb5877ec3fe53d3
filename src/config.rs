use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TwoFactorError};
use crate::lockout::LockoutPolicy;
use crate::utils::get_env_with_prefix;

/// Longest accepted SMS/Email code lifetime (one day).
pub const MAX_CODE_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest accepted lockout (one year).
pub const MAX_LOCKOUT_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuration for the two-factor service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TwoFactorConfig {
    /// Issuer label shown in authenticator apps and code messages.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// TOTP time step in seconds.
    #[serde(default = "default_time_step_secs")]
    pub time_step_secs: u64,
    /// Digits in SMS/Email one-time codes.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// How long an SMS/Email one-time code stays valid, in seconds.
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    /// Backup codes generated per setup/regeneration.
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
    /// Consecutive failed verifications before lockout.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    /// Lockout duration in seconds.
    #[serde(default = "default_lockout_duration_secs")]
    pub lockout_duration_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            time_step_secs: default_time_step_secs(),
            code_length: default_code_length(),
            code_ttl_secs: default_code_ttl_secs(),
            backup_code_count: default_backup_code_count(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration_secs: default_lockout_duration_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_issuer() -> String {
    "App".to_string()
}

fn default_time_step_secs() -> u64 {
    crate::totp::DEFAULT_TIME_STEP
}

fn default_code_length() -> usize {
    crate::generator::DEFAULT_CODE_LENGTH
}

fn default_code_ttl_secs() -> u64 {
    10 * 60
}

fn default_backup_code_count() -> usize {
    10
}

fn default_max_failed_attempts() -> u32 {
    crate::lockout::DEFAULT_MAX_ATTEMPTS
}

fn default_lockout_duration_secs() -> u64 {
    crate::lockout::DEFAULT_LOCKOUT_DURATION.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

impl TwoFactorConfig {
    /// Create a config with the given issuer and defaults elsewhere.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Default::default()
        }
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_duration_secs)
    }

    /// The lockout policy described by this config.
    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy::new()
            .max_attempts(self.max_failed_attempts)
            .lockout_duration(self.lockout_duration())
    }

    /// Check every setting, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(TwoFactorError::config("issuer must not be empty"));
        }
        if self.issuer.contains(':') {
            return Err(TwoFactorError::config(
                "issuer must not contain ':' (it separates issuer and account in otpauth labels)",
            ));
        }
        if self.time_step_secs == 0 {
            return Err(TwoFactorError::config("time_step_secs must be greater than 0"));
        }
        if !(4..=10).contains(&self.code_length) {
            return Err(TwoFactorError::config(format!(
                "code_length must be between 4 and 10, got {}",
                self.code_length
            )));
        }
        if self.code_ttl_secs == 0 {
            return Err(TwoFactorError::config("code_ttl_secs must be greater than 0"));
        }
        if self.code_ttl_secs > MAX_CODE_TTL_SECS {
            return Err(TwoFactorError::config(format!(
                "code_ttl_secs must be at most {}, got {}",
                MAX_CODE_TTL_SECS, self.code_ttl_secs
            )));
        }
        if self.backup_code_count == 0 {
            return Err(TwoFactorError::config("backup_code_count must be at least 1"));
        }
        if self.max_failed_attempts == 0 {
            return Err(TwoFactorError::config("max_failed_attempts must be at least 1"));
        }
        if self.lockout_duration_secs > MAX_LOCKOUT_DURATION_SECS {
            return Err(TwoFactorError::config(format!(
                "lockout_duration_secs must be at most {}, got {}",
                MAX_LOCKOUT_DURATION_SECS, self.lockout_duration_secs
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(TwoFactorError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(())
    }
}

/// Builder for [`TwoFactorConfig`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct TwoFactorConfigBuilder {
    config: TwoFactorConfig,
}

impl TwoFactorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TwoFactorConfig::default(),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config.issuer = issuer.into();
        self
    }

    pub fn with_time_step_secs(mut self, secs: u64) -> Self {
        self.config.time_step_secs = secs;
        self
    }

    pub fn with_code_length(mut self, length: usize) -> Self {
        self.config.code_length = length;
        self
    }

    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.config.code_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_backup_code_count(mut self, count: usize) -> Self {
        self.config.backup_code_count = count;
        self
    }

    pub fn with_max_failed_attempts(mut self, max: u32) -> Self {
        self.config.max_failed_attempts = max;
        self
    }

    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.config.lockout_duration_secs = duration.as_secs();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Load settings from `TWO_FACTOR_*` environment variables.
    ///
    /// Each key falls back to its unprefixed name. Unparseable values are
    /// ignored and the current setting is kept.
    pub fn from_env(mut self) -> Self {
        if let Some(issuer) = get_env_with_prefix("ISSUER") {
            self.config.issuer = issuer;
        }
        if let Some(step) = parse_env("TIME_STEP_SECS") {
            self.config.time_step_secs = step;
        }
        if let Some(length) = parse_env("CODE_LENGTH") {
            self.config.code_length = length;
        }
        if let Some(ttl) = parse_env("CODE_TTL_SECS") {
            self.config.code_ttl_secs = ttl;
        }
        if let Some(count) = parse_env("BACKUP_CODE_COUNT") {
            self.config.backup_code_count = count;
        }
        if let Some(max) = parse_env("MAX_FAILED_ATTEMPTS") {
            self.config.max_failed_attempts = max;
        }
        if let Some(secs) = parse_env("LOCKOUT_DURATION_SECS") {
            self.config.lockout_duration_secs = secs;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }
        self
    }

    /// Build the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::Config`] describing the first invalid setting.
    pub fn build(self) -> Result<TwoFactorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TwoFactorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TwoFactorConfig::default();
        assert_eq!(config.issuer, "App");
        assert_eq!(config.time_step_secs, 30);
        assert_eq!(config.code_length, 6);
        assert_eq!(config.backup_code_count, 10);
        assert_eq!(config.max_failed_attempts, 5);
        assert_eq!(config.lockout_duration(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TwoFactorConfigBuilder::new()
            .with_issuer("Acme")
            .with_code_length(8)
            .with_code_ttl(Duration::from_secs(300))
            .with_backup_code_count(4)
            .with_max_failed_attempts(3)
            .with_lockout_duration(Duration::from_secs(60))
            .build()
            .unwrap();

        assert_eq!(config.issuer, "Acme");
        assert_eq!(config.code_length, 8);
        assert_eq!(config.code_ttl(), Duration::from_secs(300));
        let policy = config.lockout_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.lockout_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            TwoFactorConfigBuilder::new().with_issuer(""),
            TwoFactorConfigBuilder::new().with_issuer("Acme:Corp"),
            TwoFactorConfigBuilder::new().with_time_step_secs(0),
            TwoFactorConfigBuilder::new().with_code_length(3),
            TwoFactorConfigBuilder::new().with_code_length(11),
            TwoFactorConfigBuilder::new().with_code_ttl(Duration::ZERO),
            TwoFactorConfigBuilder::new().with_code_ttl(Duration::from_secs(u64::MAX)),
            TwoFactorConfigBuilder::new().with_backup_code_count(0),
            TwoFactorConfigBuilder::new().with_max_failed_attempts(0),
            TwoFactorConfigBuilder::new().with_lockout_duration(Duration::from_secs(u64::MAX)),
            TwoFactorConfigBuilder::new().with_log_level("loud"),
        ];

        for builder in cases {
            assert!(matches!(builder.build(), Err(TwoFactorError::Config(_))));
        }
    }

    #[test]
    fn test_validation_accepts_upper_bounds() {
        let config = TwoFactorConfigBuilder::new()
            .with_code_ttl(Duration::from_secs(MAX_CODE_TTL_SECS))
            .with_lockout_duration(Duration::from_secs(MAX_LOCKOUT_DURATION_SECS))
            .build()
            .unwrap();
        assert_eq!(config.code_ttl_secs, MAX_CODE_TTL_SECS);

        let over = TwoFactorConfigBuilder::new()
            .with_lockout_duration(Duration::from_secs(MAX_LOCKOUT_DURATION_SECS + 1))
            .build();
        assert!(matches!(over, Err(TwoFactorError::Config(_))));
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TWO_FACTOR_ISSUER", "EnvApp");
            std::env::set_var("TWO_FACTOR_MAX_FAILED_ATTEMPTS", "7");
            std::env::set_var("TWO_FACTOR_CODE_LENGTH", "not-a-number");
        }

        let config = TwoFactorConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.issuer, "EnvApp");
        assert_eq!(config.max_failed_attempts, 7);
        assert_eq!(config.code_length, 6);

        unsafe {
            std::env::remove_var("TWO_FACTOR_ISSUER");
            std::env::remove_var("TWO_FACTOR_MAX_FAILED_ATTEMPTS");
            std::env::remove_var("TWO_FACTOR_CODE_LENGTH");
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TwoFactorConfig =
            serde_json::from_str(r#"{"issuer":"Json","max_failed_attempts":3}"#).unwrap();
        assert_eq!(config.issuer, "Json");
        assert_eq!(config.max_failed_attempts, 3);
        assert_eq!(config.time_step_secs, 30);
        assert_eq!(config.logging.level, "info");
    }
}
