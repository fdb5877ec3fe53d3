//! Failed-attempt lockout policy.
//!
//! Only login-time verification (code or backup code) counts towards the
//! lockout. Once `max_attempts` consecutive failures accumulate, every
//! verification is rejected until `lockout_duration` has elapsed, regardless
//! of whether the submitted code is correct.
//!
//! # Example
//!
//! ```rust
//! use second_factor::LockoutPolicy;
//! use std::time::Duration;
//!
//! let policy = LockoutPolicy::new()
//!     .max_attempts(5)
//!     .lockout_duration(Duration::from_secs(15 * 60));
//!
//! assert!(!policy.should_lock(4));
//! assert!(policy.should_lock(5));
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Default maximum failed attempts before lockout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default lockout duration (15 minutes).
pub const DEFAULT_LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);

/// Lockout policy configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    /// Consecutive failed attempts that trigger a lockout.
    pub max_attempts: u32,
    /// How long the account stays locked.
    pub lockout_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_duration: DEFAULT_LOCKOUT_DURATION,
        }
    }
}

impl LockoutPolicy {
    /// Create a new policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strict policy (3 attempts, 30 min lockout).
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_attempts: 3,
            lockout_duration: Duration::from_secs(30 * 60),
        }
    }

    /// Create a lenient policy (10 attempts, 5 min lockout).
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            max_attempts: 10,
            lockout_duration: Duration::from_secs(5 * 60),
        }
    }

    /// Set the maximum failed attempts before lockout.
    ///
    /// Note: a value of 0 behaves like 1 (lock on first failure).
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the lockout duration.
    #[must_use]
    pub fn lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }

    /// Whether `failed_attempts` consecutive failures should lock the account.
    #[must_use]
    pub fn should_lock(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts.max(1)
    }

    /// Failures left before the next one locks the account.
    #[must_use]
    pub fn attempts_remaining(&self, failed_attempts: u32) -> u32 {
        self.max_attempts.max(1).saturating_sub(failed_attempts)
    }

    /// When a lockout triggered at `now` expires.
    ///
    /// Durations too large to represent are capped rather than overflowing.
    #[must_use]
    pub fn locked_until(&self, now: SystemTime) -> SystemTime {
        crate::clock::saturating_add(now, self.lockout_duration)
    }
}

/// Lockout snapshot for a single record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutStatus {
    /// Consecutive failed attempts.
    pub failed_attempts: u32,
    /// When the lockout expires, if one was set.
    pub locked_until: Option<SystemTime>,
}

impl LockoutStatus {
    /// Whether the lockout is active at `now`.
    #[must_use]
    pub fn is_locked_at(&self, now: SystemTime) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Remaining lockout time at `now` (zero if not locked).
    #[must_use]
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.locked_until
            .and_then(|until| until.duration_since(now).ok())
            .unwrap_or_default()
    }
}

/// Result of recording a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailedAttempt {
    /// Failure count after this attempt.
    pub failed_attempts: u32,
    /// Whether this attempt triggered the lockout.
    pub just_locked: bool,
    /// When the lockout expires (if this attempt triggered one).
    pub locked_until: Option<SystemTime>,
}
