//! Second Factor - two-factor authentication core
//!
//! TOTP authenticator apps, SMS and email one-time codes, backup codes, and a
//! failed-attempt lockout, behind storage and delivery traits you implement
//! for your own infrastructure.
//!
//! # Features
//!
//! - **TOTP**: RFC 6238 codes with a one-step clock-skew window
//! - **One-time codes**: single-use, expiring SMS/Email challenges
//! - **Backup codes**: `XXXX-XXXX` recovery codes, removed once redeemed
//! - **Lockout**: configurable failure threshold and lockout duration
//! - **Optimistic concurrency**: versioned record writes with one retry
//! - **Cancellation**: nothing is persisted once a [`CancelToken`] fires
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use second_factor::delivery::ConsoleDelivery;
//! use second_factor::storage::{InMemoryCodeStore, InMemoryRecordStore};
//! use second_factor::{MethodKind, TwoFactorConfigBuilder, TwoFactorService};
//!
//! #[tokio::main]
//! async fn main() -> second_factor::Result<()> {
//!     second_factor::init_tracing();
//!
//!     let config = TwoFactorConfigBuilder::new().from_env().build()?;
//!     let service = TwoFactorService::new(
//!         InMemoryRecordStore::new(),
//!         InMemoryCodeStore::new(),
//!         ConsoleDelivery::new(),
//!         config,
//!     )?;
//!
//!     service.setup("user-1", MethodKind::Email, Some("jane@example.com")).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Backup code storage
//!
//! Backup codes are kept in the record as plaintext-comparable strings.
//! Production stores should consider hashing them at rest.

pub mod base32;
pub mod cancel;
pub mod clock;
mod config;
pub mod delivery;
mod error;
pub mod generator;
pub mod lockout;
pub mod record;
pub mod service;
pub mod storage;
pub mod totp;
mod utils;

// Re-exports for public API
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    LoggingConfig, MAX_CODE_TTL_SECS, MAX_LOCKOUT_DURATION_SECS, TwoFactorConfig,
    TwoFactorConfigBuilder,
};
pub use error::{Result, TwoFactorError};
pub use generator::{BackupCodeGenerator, BackupCodes};
pub use lockout::{LockoutPolicy, LockoutStatus};
pub use record::{MethodKind, OneTimeCode, TwoFactorMethod, TwoFactorRecord, TwoFactorState};
pub use service::{CodeDispatch, SetupOutcome, TwoFactorService, TwoFactorStatus};
pub use totp::TotpEngine;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "info", "two_factor.lockout=warn")
/// - `TWO_FACTOR_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install(env_filter, json_logs);
}

/// Initialize tracing from a [`LoggingConfig`].
pub fn init_tracing_with_config(config: &LoggingConfig) {
    install(EnvFilter::new(&config.level), config.json);
}

fn install(env_filter: EnvFilter, json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init so a second call (or a host app's subscriber) is not fatal
    let installed = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
