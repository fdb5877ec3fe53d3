//! Two-factor record aggregate and one-time code rows.
//!
//! [`TwoFactorRecord`] owns every state transition of a user's second factor.
//! It is loaded by user id, mutated through the methods below, and written
//! back through a [`RecordStore`](crate::storage::RecordStore) with an
//! optimistic version check.

use crate::generator::BackupCodeGenerator;
use crate::lockout::{FailedAttempt, LockoutPolicy, LockoutStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;

/// Purpose tags attached to issued one-time codes.
pub mod purpose {
    /// Code sent while enabling two-factor authentication.
    pub const ENABLE: &str = "Enable2FA";
    /// Code sent for a login-time challenge.
    pub const LOGIN: &str = "Login";
}

/// The kind of second factor, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    Authenticator,
    Sms,
    Email,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticator => "authenticator",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured second factor together with the data it needs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TwoFactorMethod {
    /// TOTP authenticator app with its Base32 shared secret.
    Authenticator { secret: String },
    /// One-time codes delivered by SMS.
    Sms { phone: String },
    /// One-time codes delivered by email.
    Email { address: String },
}

impl TwoFactorMethod {
    pub fn kind(&self) -> MethodKind {
        match self {
            Self::Authenticator { .. } => MethodKind::Authenticator,
            Self::Sms { .. } => MethodKind::Sms,
            Self::Email { .. } => MethodKind::Email,
        }
    }

    /// The TOTP secret (authenticator only).
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Authenticator { secret } => Some(secret),
            _ => None,
        }
    }

    /// The delivery contact (SMS/Email only).
    pub fn contact(&self) -> Option<&str> {
        match self {
            Self::Authenticator { .. } => None,
            Self::Sms { phone } => Some(phone),
            Self::Email { address } => Some(address),
        }
    }
}

impl fmt::Debug for TwoFactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticator { .. } => f
                .debug_struct("Authenticator")
                .field("secret", &"[redacted]")
                .finish(),
            Self::Sms { phone } => f.debug_struct("Sms").field("phone", phone).finish(),
            Self::Email { address } => f.debug_struct("Email").field("address", address).finish(),
        }
    }
}

/// Lifecycle state of a user's second factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoFactorState {
    /// No record exists.
    NoSetup,
    /// Set up but not yet confirmed with a valid code.
    PendingVerification,
    /// Confirmed and active for login.
    Enabled,
}

/// Per-user two-factor aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorRecord {
    user_id: String,
    method: TwoFactorMethod,
    backup_codes: Vec<String>,
    is_enabled: bool,
    failed_attempts: u32,
    locked_until: Option<SystemTime>,
    created_at: SystemTime,
    updated_at: SystemTime,
    /// Optimistic concurrency token, bumped by the store on every save.
    #[serde(default)]
    version: u64,
}

impl TwoFactorRecord {
    /// Create a record in `PendingVerification`.
    pub fn new_pending(
        user_id: impl Into<String>,
        method: TwoFactorMethod,
        backup_codes: Vec<String>,
        now: SystemTime,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            method,
            backup_codes,
            is_enabled: false,
            failed_attempts: 0,
            locked_until: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn method(&self) -> &TwoFactorMethod {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.method.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn state(&self) -> TwoFactorState {
        if self.is_enabled {
            TwoFactorState::Enabled
        } else {
            TwoFactorState::PendingVerification
        }
    }

    pub fn backup_codes(&self) -> &[String] {
        &self.backup_codes
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn locked_until(&self) -> Option<SystemTime> {
        self.locked_until
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn updated_at(&self) -> SystemTime {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Return the record with its stored version set. Used by store implementations.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn lockout_status(&self) -> LockoutStatus {
        LockoutStatus {
            failed_attempts: self.failed_attempts,
            locked_until: self.locked_until,
        }
    }

    /// The unlock time if the record is locked at `now`.
    pub fn active_lock(&self, now: SystemTime) -> Option<SystemTime> {
        self.locked_until.filter(|until| now < *until)
    }

    /// Overwrite a pending record with a new method and backup codes.
    ///
    /// Counters and lockout are cleared; `created_at` is kept.
    pub fn reset_pending(
        &mut self,
        method: TwoFactorMethod,
        backup_codes: Vec<String>,
        now: SystemTime,
    ) {
        self.method = method;
        self.backup_codes = backup_codes;
        self.is_enabled = false;
        self.failed_attempts = 0;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// Flip the record to enabled after a successful confirmation.
    pub fn enable(&mut self, now: SystemTime) {
        self.is_enabled = true;
        self.failed_attempts = 0;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// Turn two-factor authentication off, keeping the record.
    pub fn disable(&mut self, now: SystemTime) {
        self.is_enabled = false;
        self.failed_attempts = 0;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// Reset failure bookkeeping after a successful verification.
    pub fn record_success(&mut self, now: SystemTime) {
        self.failed_attempts = 0;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// Count a failed verification, locking the record if the policy says so.
    ///
    /// A lockout that has already expired is discarded first, so the count
    /// restarts at 1.
    pub fn record_failure(&mut self, policy: &LockoutPolicy, now: SystemTime) -> FailedAttempt {
        if self.locked_until.is_some_and(|until| until <= now) {
            self.failed_attempts = 0;
            self.locked_until = None;
        }

        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.updated_at = now;

        let just_locked = policy.should_lock(self.failed_attempts);
        if just_locked {
            self.locked_until = Some(policy.locked_until(now));
        }

        FailedAttempt {
            failed_attempts: self.failed_attempts,
            just_locked,
            locked_until: self.locked_until,
        }
    }

    /// Clear any lockout. Returns whether a lockout was active at `now`.
    pub fn clear_lockout(&mut self, now: SystemTime) -> bool {
        let was_locked = self.active_lock(now).is_some();
        self.failed_attempts = 0;
        self.locked_until = None;
        self.updated_at = now;
        was_locked
    }

    /// Remove `code` from the active backup set. Returns whether it was present.
    pub fn redeem_backup_code(&mut self, code: &str, now: SystemTime) -> bool {
        match BackupCodeGenerator::verify(code, &self.backup_codes) {
            Some(index) => {
                self.backup_codes.remove(index);
                self.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// Replace the whole backup code set.
    pub fn replace_backup_codes(&mut self, codes: Vec<String>, now: SystemTime) {
        self.backup_codes = codes;
        self.updated_at = now;
    }
}

/// An issued SMS/Email challenge code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeCode {
    /// Row identifier used for single-use consumption.
    pub id: String,
    pub user_id: String,
    pub code: String,
    pub method: MethodKind,
    /// Phone number or email address the code was delivered to.
    #[serde(default)]
    pub sent_to: String,
    /// Free-form tag, see [`purpose`].
    pub purpose: String,
    pub expires_at: SystemTime,
    pub is_used: bool,
    pub created_at: SystemTime,
}

impl OneTimeCode {
    /// Issue a new unused code for `method`, valid for `ttl` from `now`.
    pub fn issue(
        user_id: impl Into<String>,
        code: impl Into<String>,
        method: &TwoFactorMethod,
        purpose: impl Into<String>,
        now: SystemTime,
        ttl: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            code: code.into(),
            method: method.kind(),
            sent_to: method.contact().unwrap_or_default().to_string(),
            purpose: purpose.into(),
            expires_at: crate::clock::saturating_add(now, ttl),
            is_used: false,
            created_at: now,
        }
    }

    /// Unused and not yet expired at `now`.
    pub fn is_usable_at(&self, now: SystemTime) -> bool {
        !self.is_used && now < self.expires_at
    }

    /// Whether this code was sent through `method` to its current contact.
    ///
    /// Codes sent to a contact the record no longer uses never match.
    pub fn issued_for(&self, method: &TwoFactorMethod) -> bool {
        self.method == method.kind() && method.contact() == Some(self.sent_to.as_str())
    }

    /// Whether this row belongs to `user_id`, carries `code`, was issued for
    /// `method`, and (if given) has the requested purpose.
    pub fn matches(
        &self,
        user_id: &str,
        code: &str,
        method: &TwoFactorMethod,
        purpose: Option<&str>,
    ) -> bool {
        self.user_id == user_id
            && self.issued_for(method)
            && purpose.is_none_or(|p| self.purpose == p)
            && bool::from(self.code.as_bytes().ct_eq(code.as_bytes()))
    }
}
