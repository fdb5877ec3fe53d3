//! Two-factor orchestration: setup, enable, login verification, backup codes.
//!
//! [`TwoFactorService`] ties the TOTP engine, the code generators, the record
//! and code stores, and the delivery channel together. Every mutating call
//! follows the same shape:
//!
//! 1. read the record (and validate the submitted code),
//! 2. check the [`CancelToken`],
//! 3. write with an optimistic version check, re-reading and re-applying the
//!    decided outcome once if another writer got there first.
//!
//! Nothing is persisted before step 2, so a cancelled call leaves no trace.
//! For SMS/Email codes the one-time code row is consumed at step 2, before the
//! record write, and is never re-validated on retry.
//!
//! # Example
//!
//! ```rust,no_run
//! use second_factor::delivery::ConsoleDelivery;
//! use second_factor::storage::{InMemoryCodeStore, InMemoryRecordStore};
//! use second_factor::{MethodKind, SetupOutcome, TwoFactorConfigBuilder, TwoFactorService};
//!
//! # async fn run() -> second_factor::Result<()> {
//! let config = TwoFactorConfigBuilder::new().with_issuer("Acme").build()?;
//! let service = TwoFactorService::new(
//!     InMemoryRecordStore::new(),
//!     InMemoryCodeStore::new(),
//!     ConsoleDelivery::new(),
//!     config,
//! )?;
//!
//! if let SetupOutcome::Authenticator { provisioning_uri, .. } =
//!     service.setup("user-1", MethodKind::Authenticator, Some("jane@example.com")).await?
//! {
//!     println!("scan {provisioning_uri}");
//! }
//!
//! service.enable("user-1", "123456").await?;
//! let ok = service.verify("user-1", "654321").await?;
//! # let _ = ok;
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::TwoFactorConfig;
use crate::delivery::{CodeMessage, DeliveryChannel, mask_contact};
use crate::error::{Result, TwoFactorError};
use crate::generator::{BackupCodeGenerator, BackupCodes, generate_numeric_code, generate_secret};
use crate::lockout::LockoutPolicy;
use crate::record::{
    MethodKind, OneTimeCode, TwoFactorMethod, TwoFactorRecord, TwoFactorState, purpose,
};
use crate::storage::{CodeStore, MarkUsed, RecordStore, SaveOutcome};
use crate::totp::{TotpEngine, normalize_code, provisioning_uri};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Writes attempted per operation before giving up with [`TwoFactorError::Conflict`].
const MAX_COMMIT_ATTEMPTS: u32 = 2;

/// Confirmation that a one-time code was issued and handed to the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeDispatch {
    pub method: MethodKind,
    /// Masked phone number or email address.
    pub destination: String,
    pub expires_at: SystemTime,
}

/// What [`TwoFactorService::setup`] hands back to the caller.
#[derive(Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Show the secret (or a QR code of the URI) to the user.
    Authenticator {
        secret: String,
        provisioning_uri: String,
        backup_codes: BackupCodes,
    },
    /// An `Enable2FA` code was sent out of band.
    CodeSent {
        dispatch: CodeDispatch,
        backup_codes: BackupCodes,
    },
}

impl SetupOutcome {
    pub fn backup_codes(&self) -> &BackupCodes {
        match self {
            Self::Authenticator { backup_codes, .. } | Self::CodeSent { backup_codes, .. } => {
                backup_codes
            }
        }
    }

    pub fn method(&self) -> MethodKind {
        match self {
            Self::Authenticator { .. } => MethodKind::Authenticator,
            Self::CodeSent { dispatch, .. } => dispatch.method,
        }
    }
}

impl fmt::Debug for SetupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticator { backup_codes, .. } => f
                .debug_struct("Authenticator")
                .field("secret", &"[redacted]")
                .field("backup_codes", &backup_codes.len())
                .finish(),
            Self::CodeSent {
                dispatch,
                backup_codes,
            } => f
                .debug_struct("CodeSent")
                .field("dispatch", dispatch)
                .field("backup_codes", &backup_codes.len())
                .finish(),
        }
    }
}

/// Read-only view of a user's two-factor state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TwoFactorStatus {
    pub state: TwoFactorState,
    pub method: Option<MethodKind>,
    pub backup_codes_remaining: usize,
    pub failed_attempts: u32,
    /// Set only while a lockout is in force.
    pub locked_until: Option<SystemTime>,
}

impl TwoFactorStatus {
    fn not_set_up() -> Self {
        Self {
            state: TwoFactorState::NoSetup,
            method: None,
            backup_codes_remaining: 0,
            failed_attempts: 0,
            locked_until: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == TwoFactorState::Enabled
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until.is_some()
    }
}

/// The two-factor authentication service.
pub struct TwoFactorService<R, C, D>
where
    R: RecordStore,
    C: CodeStore,
    D: DeliveryChannel,
{
    records: R,
    codes: C,
    delivery: D,
    clock: Arc<dyn Clock>,
    config: TwoFactorConfig,
    totp: TotpEngine,
    policy: LockoutPolicy,
    backup_codes: BackupCodeGenerator,
}

impl<R, C, D> TwoFactorService<R, C, D>
where
    R: RecordStore,
    C: CodeStore,
    D: DeliveryChannel,
{
    /// Create a service using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::Config`] if `config` is invalid.
    pub fn new(records: R, codes: C, delivery: D, config: TwoFactorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            records,
            codes,
            delivery,
            clock: Arc::new(SystemClock),
            totp: TotpEngine::new(config.time_step_secs),
            policy: config.lockout_policy(),
            backup_codes: BackupCodeGenerator::new().with_count(config.backup_code_count),
            config,
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &TwoFactorConfig {
        &self.config
    }

    pub fn lockout_policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Start (or restart) two-factor setup for a user.
    ///
    /// For [`MethodKind::Authenticator`] `contact` is only used as the account
    /// label in the provisioning URI and defaults to `user_id`. SMS and Email
    /// require it.
    pub async fn setup(
        &self,
        user_id: &str,
        method: MethodKind,
        contact: Option<&str>,
    ) -> Result<SetupOutcome> {
        self.setup_with_cancel(user_id, method, contact, &CancelToken::new())
            .await
    }

    pub async fn setup_with_cancel(
        &self,
        user_id: &str,
        kind: MethodKind,
        contact: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<SetupOutcome> {
        let now = self.clock.now();
        let method = build_method(kind, contact)?;
        let backup_codes = self.backup_codes.generate();

        tracing::info!(
            target: "two_factor.setup.started",
            user_id = %user_id,
            method = %kind,
            "Two-factor setup started"
        );

        let existing = self.records.get(user_id).await?;
        if existing.as_ref().is_some_and(TwoFactorRecord::is_enabled) {
            return Err(TwoFactorError::AlreadyEnabled);
        }
        checkpoint(cancel, user_id, "setup")?;

        let record = self
            .commit(user_id, "setup", existing, |current| match current {
                Some(record) if record.is_enabled() => Err(TwoFactorError::AlreadyEnabled),
                Some(mut record) => {
                    record.reset_pending(method.clone(), backup_codes.codes.clone(), now);
                    Ok(record)
                }
                None => Ok(TwoFactorRecord::new_pending(
                    user_id,
                    method.clone(),
                    backup_codes.codes.clone(),
                    now,
                )),
            })
            .await?;

        let outcome = match record.method() {
            TwoFactorMethod::Authenticator { secret } => {
                let account = contact
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .unwrap_or(user_id);
                SetupOutcome::Authenticator {
                    provisioning_uri: provisioning_uri(&self.config.issuer, account, secret),
                    secret: secret.clone(),
                    backup_codes,
                }
            }
            TwoFactorMethod::Sms { .. } | TwoFactorMethod::Email { .. } => {
                let dispatch = self
                    .dispatch_code(user_id, record.method(), purpose::ENABLE, now)
                    .await?;
                SetupOutcome::CodeSent {
                    dispatch,
                    backup_codes,
                }
            }
        };

        tracing::info!(
            target: "two_factor.setup.completed",
            user_id = %user_id,
            method = %kind,
            "Two-factor setup pending verification"
        );

        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Enable
    // ---------------------------------------------------------------------

    /// Confirm a pending setup with a code, turning two-factor on.
    ///
    /// Failed attempts here do not count towards the lockout.
    pub async fn enable(&self, user_id: &str, code: &str) -> Result<()> {
        self.enable_with_cancel(user_id, code, &CancelToken::new())
            .await
    }

    pub async fn enable_with_cancel(
        &self,
        user_id: &str,
        code: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let now = self.clock.now();
        let record = self
            .records
            .get(user_id)
            .await?
            .ok_or(TwoFactorError::NotSetUp)?;
        if record.is_enabled() {
            return Err(TwoFactorError::AlreadyEnabled);
        }

        let confirmed_method = record.method().clone();
        let valid = self
            .check_code(&record, code, Some(purpose::ENABLE), now, cancel)
            .await?;

        if !valid {
            tracing::warn!(
                target: "two_factor.enable.failed",
                user_id = %user_id,
                method = %record.kind(),
                "Invalid code while enabling two-factor"
            );
            return Err(TwoFactorError::InvalidCode);
        }

        self.commit(user_id, "enable", Some(record), |current| {
            let mut record = current.ok_or(TwoFactorError::NotSetUp)?;
            if record.is_enabled() {
                return Err(TwoFactorError::AlreadyEnabled);
            }
            if record.method() != &confirmed_method {
                return Err(TwoFactorError::conflict(
                    "two-factor setup was replaced while enabling",
                ));
            }
            record.enable(now);
            Ok(record)
        })
        .await?;

        tracing::info!(
            target: "two_factor.enable.succeeded",
            user_id = %user_id,
            method = %confirmed_method.kind(),
            "Two-factor authentication enabled"
        );

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Login verification
    // ---------------------------------------------------------------------

    /// Check a login-time code.
    ///
    /// Returns `Ok(false)` when two-factor is not enabled for the user or the
    /// code is wrong. A wrong code counts towards the lockout.
    ///
    /// # Errors
    ///
    /// [`TwoFactorError::AccountLocked`] while a lockout is in force, whether
    /// or not the code is correct.
    pub async fn verify(&self, user_id: &str, code: &str) -> Result<bool> {
        self.verify_with_cancel(user_id, code, &CancelToken::new())
            .await
    }

    pub async fn verify_with_cancel(
        &self,
        user_id: &str,
        code: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let now = self.clock.now();
        let Some(record) = self.enabled_record(user_id, now).await? else {
            return Ok(false);
        };

        let valid = self.check_code(&record, code, None, now, cancel).await?;
        let kind = record.kind();

        match self.record_outcome(user_id, "verify", record, valid, now).await {
            Ok(record) => {
                self.log_outcome("verify", &record, kind, valid);
                Ok(valid)
            }
            Err(TwoFactorError::NotSetUp) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Redeem a backup code in place of a regular code.
    ///
    /// A matching code is removed from the active set and counts as a
    /// successful verification. A miss counts towards the lockout.
    pub async fn verify_backup_code(&self, user_id: &str, code: &str) -> Result<bool> {
        self.verify_backup_code_with_cancel(user_id, code, &CancelToken::new())
            .await
    }

    pub async fn verify_backup_code_with_cancel(
        &self,
        user_id: &str,
        code: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let now = self.clock.now();
        let Some(record) = self.enabled_record(user_id, now).await? else {
            return Ok(false);
        };
        checkpoint(cancel, user_id, "verify_backup_code")?;

        let kind = record.kind();
        let policy = self.policy;
        let mut redeemed = false;

        let result = self
            .commit(user_id, "verify_backup_code", Some(record), |current| {
                let mut record = current
                    .filter(TwoFactorRecord::is_enabled)
                    .ok_or(TwoFactorError::NotSetUp)?;
                if let Some(until) = record.active_lock(now) {
                    return Err(TwoFactorError::locked(until, now));
                }
                redeemed = record.redeem_backup_code(code, now);
                if redeemed {
                    record.record_success(now);
                } else {
                    record.record_failure(&policy, now);
                }
                Ok(record)
            })
            .await;

        match result {
            Ok(record) => {
                if redeemed {
                    tracing::info!(
                        target: "two_factor.backup.redeemed",
                        user_id = %user_id,
                        remaining = record.backup_codes().len(),
                        "Backup code redeemed"
                    );
                }
                self.log_outcome("backup", &record, kind, redeemed);
                Ok(redeemed)
            }
            Err(TwoFactorError::NotSetUp) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace the backup code set after checking a current code.
    ///
    /// The code is checked exactly as [`verify`](Self::verify) checks it,
    /// including lockout bookkeeping.
    ///
    /// # Errors
    ///
    /// - [`TwoFactorError::NotSetUp`] if two-factor is not enabled.
    /// - [`TwoFactorError::InvalidCode`] if the code is wrong.
    /// - [`TwoFactorError::AccountLocked`] while locked.
    pub async fn regenerate_backup_codes(&self, user_id: &str, code: &str) -> Result<BackupCodes> {
        self.regenerate_backup_codes_with_cancel(user_id, code, &CancelToken::new())
            .await
    }

    pub async fn regenerate_backup_codes_with_cancel(
        &self,
        user_id: &str,
        code: &str,
        cancel: &CancelToken,
    ) -> Result<BackupCodes> {
        let now = self.clock.now();
        let record = self
            .enabled_record(user_id, now)
            .await?
            .ok_or(TwoFactorError::NotSetUp)?;

        let valid = self.check_code(&record, code, None, now, cancel).await?;
        let kind = record.kind();
        let fresh = self.backup_codes.generate();
        let policy = self.policy;

        let record = self
            .commit(user_id, "regenerate_backup_codes", Some(record), |current| {
                let mut record = current
                    .filter(TwoFactorRecord::is_enabled)
                    .ok_or(TwoFactorError::NotSetUp)?;
                if let Some(until) = record.active_lock(now) {
                    return Err(TwoFactorError::locked(until, now));
                }
                if valid {
                    record.record_success(now);
                    record.replace_backup_codes(fresh.codes.clone(), now);
                } else {
                    record.record_failure(&policy, now);
                }
                Ok(record)
            })
            .await?;

        self.log_outcome("regenerate", &record, kind, valid);
        if !valid {
            return Err(TwoFactorError::InvalidCode);
        }

        tracing::info!(
            target: "two_factor.backup.regenerated",
            user_id = %user_id,
            count = fresh.len(),
            "Backup codes regenerated"
        );

        Ok(fresh)
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    /// Turn two-factor off. The record is kept and can be set up again.
    pub async fn disable(&self, user_id: &str) -> Result<()> {
        self.disable_with_cancel(user_id, &CancelToken::new()).await
    }

    pub async fn disable_with_cancel(&self, user_id: &str, cancel: &CancelToken) -> Result<()> {
        let now = self.clock.now();
        let record = self
            .records
            .get(user_id)
            .await?
            .ok_or(TwoFactorError::NotSetUp)?;
        checkpoint(cancel, user_id, "disable")?;

        self.commit(user_id, "disable", Some(record), |current| {
            let mut record = current.ok_or(TwoFactorError::NotSetUp)?;
            record.disable(now);
            Ok(record)
        })
        .await?;

        tracing::info!(
            target: "two_factor.disabled",
            user_id = %user_id,
            "Two-factor authentication disabled"
        );

        Ok(())
    }

    /// Current state for a user.
    pub async fn status(&self, user_id: &str) -> Result<TwoFactorStatus> {
        let now = self.clock.now();
        let Some(record) = self.records.get(user_id).await? else {
            return Ok(TwoFactorStatus::not_set_up());
        };

        Ok(TwoFactorStatus {
            state: record.state(),
            method: Some(record.kind()),
            backup_codes_remaining: record.backup_codes().len(),
            failed_attempts: record.failed_attempts(),
            locked_until: record.active_lock(now),
        })
    }

    /// Issue and send a fresh code to an SMS/Email user.
    ///
    /// Pending records get an `Enable2FA` code, enabled records a `Login` code.
    pub async fn send_code(&self, user_id: &str) -> Result<CodeDispatch> {
        self.send_code_with_cancel(user_id, &CancelToken::new())
            .await
    }

    pub async fn send_code_with_cancel(
        &self,
        user_id: &str,
        cancel: &CancelToken,
    ) -> Result<CodeDispatch> {
        let now = self.clock.now();
        let record = self
            .records
            .get(user_id)
            .await?
            .ok_or(TwoFactorError::NotSetUp)?;

        let code_purpose = if record.is_enabled() {
            if let Some(until) = record.active_lock(now) {
                self.log_rejected(user_id, until, now);
                return Err(TwoFactorError::locked(until, now));
            }
            purpose::LOGIN
        } else {
            purpose::ENABLE
        };
        checkpoint(cancel, user_id, "send_code")?;

        self.dispatch_code(user_id, record.method(), code_purpose, now)
            .await
    }

    /// Clear a lockout by hand. Returns whether one was in force.
    pub async fn unlock(&self, user_id: &str) -> Result<bool> {
        self.unlock_with_cancel(user_id, &CancelToken::new()).await
    }

    pub async fn unlock_with_cancel(&self, user_id: &str, cancel: &CancelToken) -> Result<bool> {
        let now = self.clock.now();
        let record = self
            .records
            .get(user_id)
            .await?
            .ok_or_else(|| TwoFactorError::not_found(format!("two-factor record for {}", user_id)))?;
        checkpoint(cancel, user_id, "unlock")?;

        let mut was_locked = false;
        self.commit(user_id, "unlock", Some(record), |current| {
            let mut record = current.ok_or_else(|| {
                TwoFactorError::not_found(format!("two-factor record for {}", user_id))
            })?;
            was_locked = record.clear_lockout(now);
            Ok(record)
        })
        .await?;

        tracing::warn!(
            target: "two_factor.lockout.cleared",
            user_id = %user_id,
            was_locked,
            "Two-factor lockout cleared manually"
        );

        Ok(was_locked)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Load an enabled record, failing if it is locked at `now`.
    async fn enabled_record(&self, user_id: &str, now: SystemTime) -> Result<Option<TwoFactorRecord>> {
        let Some(record) = self.records.get(user_id).await? else {
            return Ok(None);
        };
        if !record.is_enabled() {
            return Ok(None);
        }
        if let Some(until) = record.active_lock(now) {
            self.log_rejected(user_id, until, now);
            return Err(TwoFactorError::locked(until, now));
        }
        Ok(Some(record))
    }

    /// Validate `code` against the record's method.
    ///
    /// The cancel token is checked exactly once, before the first write this
    /// performs or precedes.
    async fn check_code(
        &self,
        record: &TwoFactorRecord,
        code: &str,
        code_purpose: Option<&str>,
        now: SystemTime,
        cancel: &CancelToken,
    ) -> Result<bool> {
        match record.method() {
            TwoFactorMethod::Authenticator { secret } => {
                let valid = self.totp.verify(secret, code, now);
                checkpoint(cancel, record.user_id(), "check_code")?;
                Ok(valid)
            }
            TwoFactorMethod::Sms { .. } | TwoFactorMethod::Email { .. } => {
                self.consume_code(record, code, code_purpose, now, cancel).await
            }
        }
    }

    /// Consume a one-time code issued for the record's current method and
    /// contact. Codes sent before a setup switched contacts are ignored.
    async fn consume_code(
        &self,
        record: &TwoFactorRecord,
        code: &str,
        code_purpose: Option<&str>,
        now: SystemTime,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let user_id = record.user_id();
        let code = normalize_code(code);
        let found = if code.is_empty() {
            None
        } else {
            self.codes
                .find_unused_unexpired(user_id, &code, record.method(), code_purpose, now)
                .await?
        };
        checkpoint(cancel, user_id, "consume_code")?;

        let Some(found) = found else {
            return Ok(false);
        };
        match self.codes.mark_used(&found.id).await? {
            MarkUsed::Marked => Ok(true),
            MarkUsed::AlreadyUsed => {
                tracing::debug!(
                    target: "two_factor.code.replayed",
                    user_id = %user_id,
                    "One-time code consumed by a concurrent request"
                );
                Ok(false)
            }
        }
    }

    /// Persist a decided verification outcome.
    async fn record_outcome(
        &self,
        user_id: &str,
        op: &'static str,
        record: TwoFactorRecord,
        valid: bool,
        now: SystemTime,
    ) -> Result<TwoFactorRecord> {
        let policy = self.policy;
        self.commit(user_id, op, Some(record), |current| {
            let mut record = current
                .filter(TwoFactorRecord::is_enabled)
                .ok_or(TwoFactorError::NotSetUp)?;
            if let Some(until) = record.active_lock(now) {
                return Err(TwoFactorError::locked(until, now));
            }
            if valid {
                record.record_success(now);
            } else {
                record.record_failure(&policy, now);
            }
            Ok(record)
        })
        .await
    }

    /// Write `apply(current)` with a version check.
    ///
    /// On conflict the record is re-read and `apply` runs again on the fresh
    /// copy. After [`MAX_COMMIT_ATTEMPTS`] lost writes this gives up.
    async fn commit<F>(
        &self,
        user_id: &str,
        op: &'static str,
        mut current: Option<TwoFactorRecord>,
        mut apply: F,
    ) -> Result<TwoFactorRecord>
    where
        F: FnMut(Option<TwoFactorRecord>) -> Result<TwoFactorRecord> + Send,
    {
        let mut attempt = 1;
        loop {
            let expected = current.as_ref().map(TwoFactorRecord::version);
            let record = apply(current.take())?;

            match self.records.save(&record, expected).await? {
                SaveOutcome::Saved { version } => return Ok(record.with_version(version)),
                SaveOutcome::Conflict if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(
                        target: "two_factor.store.conflict",
                        user_id = %user_id,
                        op,
                        attempt,
                        "Record changed concurrently, retrying"
                    );
                    attempt += 1;
                    current = self.records.get(user_id).await?;
                }
                SaveOutcome::Conflict => {
                    tracing::warn!(
                        target: "two_factor.store.conflict",
                        user_id = %user_id,
                        op,
                        "Giving up after repeated concurrent modification"
                    );
                    return Err(TwoFactorError::conflict(format!(
                        "{} for user {} lost {} concurrent writes",
                        op, user_id, MAX_COMMIT_ATTEMPTS
                    )));
                }
            }
        }
    }

    async fn dispatch_code(
        &self,
        user_id: &str,
        method: &TwoFactorMethod,
        code_purpose: &str,
        now: SystemTime,
    ) -> Result<CodeDispatch> {
        let (kind, contact) = match method {
            TwoFactorMethod::Authenticator { .. } => {
                return Err(TwoFactorError::UnsupportedMethod(
                    "authenticator codes are generated on the device".to_string(),
                ));
            }
            TwoFactorMethod::Sms { phone } => (MethodKind::Sms, phone.as_str()),
            TwoFactorMethod::Email { address } => (MethodKind::Email, address.as_str()),
        };

        let ttl = self.config.code_ttl();
        let code = generate_numeric_code(self.config.code_length);
        let issued = OneTimeCode::issue(user_id, code.as_str(), method, code_purpose, now, ttl);
        self.codes.insert(&issued).await?;

        let message = CodeMessage {
            code: &code,
            issuer: &self.config.issuer,
            ttl,
        };
        let destination = mask_contact(kind, contact);
        let sent = match kind {
            MethodKind::Email => {
                self.delivery
                    .send_email(contact, &message.email_subject(), &message.email_body())
                    .await
            }
            _ => self.delivery.send_sms(contact, &message.sms_text()).await,
        };

        if let Err(e) = sent {
            tracing::warn!(
                target: "two_factor.delivery.failed",
                user_id = %user_id,
                method = %kind,
                destination = %destination,
                error = %e,
                "Failed to deliver one-time code"
            );
            return Err(e.into());
        }

        tracing::info!(
            target: "two_factor.code.sent",
            user_id = %user_id,
            method = %kind,
            purpose = %code_purpose,
            destination = %destination,
            "One-time code sent"
        );

        Ok(CodeDispatch {
            method: kind,
            destination,
            expires_at: issued.expires_at,
        })
    }

    fn log_outcome(&self, op: &'static str, record: &TwoFactorRecord, kind: MethodKind, valid: bool) {
        if valid {
            tracing::info!(
                target: "two_factor.verify.succeeded",
                user_id = %record.user_id(),
                method = %kind,
                op,
                "Two-factor verification succeeded"
            );
            return;
        }

        tracing::warn!(
            target: "two_factor.verify.failed",
            user_id = %record.user_id(),
            method = %kind,
            op,
            failed_attempts = record.failed_attempts(),
            attempts_remaining = self.policy.attempts_remaining(record.failed_attempts()),
            "Two-factor verification failed"
        );

        if let Some(until) = record.locked_until() {
            tracing::warn!(
                target: "two_factor.lockout.locked",
                user_id = %record.user_id(),
                failed_attempts = record.failed_attempts(),
                locked_for_secs = self.policy.lockout_duration.as_secs(),
                locked_until = ?until,
                "Two-factor locked after repeated failures"
            );
        }
    }

    fn log_rejected(&self, user_id: &str, until: SystemTime, now: SystemTime) {
        tracing::info!(
            target: "two_factor.lockout.rejected",
            user_id = %user_id,
            remaining_secs = until.duration_since(now).unwrap_or_default().as_secs(),
            "Two-factor attempt rejected while locked"
        );
    }
}

fn checkpoint(cancel: &CancelToken, user_id: &str, op: &'static str) -> Result<()> {
    cancel.check().inspect_err(|_| {
        tracing::debug!(
            target: "two_factor.cancelled",
            user_id = %user_id,
            op,
            "Operation cancelled before commit"
        );
    })
}

fn build_method(kind: MethodKind, contact: Option<&str>) -> Result<TwoFactorMethod> {
    match kind {
        MethodKind::Authenticator => Ok(TwoFactorMethod::Authenticator {
            secret: generate_secret(),
        }),
        MethodKind::Sms => {
            let phone = contact
                .and_then(normalize_phone)
                .ok_or_else(|| TwoFactorError::invalid_contact("a valid phone number is required"))?;
            Ok(TwoFactorMethod::Sms { phone })
        }
        MethodKind::Email => {
            let address = contact
                .map(str::trim)
                .filter(|a| is_plausible_email(a))
                .ok_or_else(|| TwoFactorError::invalid_contact("a valid email address is required"))?;
            Ok(TwoFactorMethod::Email {
                address: address.to_string(),
            })
        }
    }
}

/// Strip formatting from a phone number. Accepts an optional leading `+` and
/// 7 to 15 digits.
fn normalize_phone(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (plus, rest) = match raw.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", raw),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return None,
        }
    }

    (7..=15)
        .contains(&digits.len())
        .then(|| format!("{}{}", plus, digits))
}

fn is_plausible_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !address.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::RecordingDelivery;
    use crate::storage::{InMemoryCodeStore, InMemoryRecordStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECRET: &str = "JBSWY3DPEHPK3PXP";

    /// Loses the next `conflicts` saves to a simulated concurrent writer.
    #[derive(Clone, Default)]
    struct ContendedStore {
        inner: InMemoryRecordStore,
        conflicts: Arc<AtomicU32>,
    }

    impl ContendedStore {
        fn lose_next(&self, n: u32) {
            self.conflicts.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RecordStore for ContendedStore {
        async fn get(&self, user_id: &str) -> Result<Option<TwoFactorRecord>> {
            self.inner.get(user_id).await
        }

        async fn save(
            &self,
            record: &TwoFactorRecord,
            expected_version: Option<u64>,
        ) -> Result<SaveOutcome> {
            let lose = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                // Another writer touches the record, bumping its version.
                if let Some(stored) = self.inner.get(record.user_id()).await? {
                    let version = stored.version();
                    self.inner.save(&stored, Some(version)).await?;
                }
                return Ok(SaveOutcome::Conflict);
            }
            self.inner.save(record, expected_version).await
        }
    }

    fn config() -> TwoFactorConfig {
        TwoFactorConfig::new("Acme")
    }

    fn service_with<R: RecordStore>(
        records: R,
        clock: &ManualClock,
    ) -> TwoFactorService<R, InMemoryCodeStore, RecordingDelivery> {
        TwoFactorService::new(records, InMemoryCodeStore::new(), RecordingDelivery::new(), config())
            .unwrap()
            .with_clock(clock.clone())
    }

    async fn seed_enabled<R: RecordStore>(records: &R, user_id: &str, clock: &ManualClock) {
        let mut record = TwoFactorRecord::new_pending(
            user_id,
            TwoFactorMethod::Authenticator {
                secret: SECRET.to_string(),
            },
            vec!["AAAA-1111".to_string(), "BBBB-2222".to_string()],
            clock.now(),
        );
        record.enable(clock.now());
        records.save(&record, None).await.unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = config();
        config.code_length = 2;
        let result = TwoFactorService::new(
            InMemoryRecordStore::new(),
            InMemoryCodeStore::new(),
            RecordingDelivery::new(),
            config,
        );
        assert!(matches!(result, Err(TwoFactorError::Config(_))));
    }

    #[test]
    fn test_build_method_validates_contacts() {
        assert!(matches!(
            build_method(MethodKind::Sms, None),
            Err(TwoFactorError::InvalidContact(_))
        ));
        assert!(matches!(
            build_method(MethodKind::Sms, Some("call me")),
            Err(TwoFactorError::InvalidContact(_))
        ));
        assert_eq!(
            build_method(MethodKind::Sms, Some(" +1 (555) 123-4567 ")).unwrap(),
            TwoFactorMethod::Sms {
                phone: "+15551234567".to_string()
            }
        );
        assert!(matches!(
            build_method(MethodKind::Email, Some("not-an-email")),
            Err(TwoFactorError::InvalidContact(_))
        ));
        assert_eq!(
            build_method(MethodKind::Email, Some(" jane@example.com ")).unwrap(),
            TwoFactorMethod::Email {
                address: "jane@example.com".to_string()
            }
        );

        let auth = build_method(MethodKind::Authenticator, None).unwrap();
        assert_eq!(auth.secret().map(str::len), Some(32));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once() {
        let clock = ManualClock::at_unix(59);
        let records = ContendedStore::default();
        seed_enabled(&records, "u1", &clock).await;
        let service = service_with(records.clone(), &clock);

        records.lose_next(1);
        assert!(!service.verify("u1", "000000").await.unwrap());

        let stored = records.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.failed_attempts(), 1);
        // seed, concurrent touch, our retry
        assert_eq!(stored.version(), 3);
    }

    #[tokio::test]
    async fn test_second_conflict_surfaces() {
        let clock = ManualClock::at_unix(59);
        let records = ContendedStore::default();
        seed_enabled(&records, "u1", &clock).await;
        let service = service_with(records.clone(), &clock);

        records.lose_next(2);
        let err = service.verify("u1", "000000").await.unwrap_err();
        assert!(matches!(err, TwoFactorError::Conflict(_)));
        assert_eq!(records.get("u1").await.unwrap().unwrap().failed_attempts(), 0);
    }

    #[tokio::test]
    async fn test_retry_reapplies_success() {
        let clock = ManualClock::at_unix(59);
        let records = ContendedStore::default();
        seed_enabled(&records, "u1", &clock).await;
        let service = service_with(records.clone(), &clock);

        assert!(!service.verify("u1", "000000").await.unwrap());
        records.lose_next(1);
        assert!(service.verify("u1", "996554").await.unwrap());
        assert_eq!(records.get("u1").await.unwrap().unwrap().failed_attempts(), 0);
    }

    #[tokio::test]
    async fn test_verify_without_record_is_false() {
        let clock = ManualClock::at_unix(59);
        let service = service_with(InMemoryRecordStore::new(), &clock);
        assert!(!service.verify("nobody", "996554").await.unwrap());
        assert!(!service.verify_backup_code("nobody", "AAAA-1111").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_active_lock_only() {
        let clock = ManualClock::at_unix(59);
        let records = InMemoryRecordStore::new();
        seed_enabled(&records, "u1", &clock).await;
        let service = service_with(records, &clock);

        assert_eq!(service.status("ghost").await.unwrap().state, TwoFactorState::NoSetup);

        for _ in 0..5 {
            service.verify("u1", "000000").await.unwrap();
        }
        let status = service.status("u1").await.unwrap();
        assert!(status.is_enabled());
        assert!(status.is_locked());
        assert_eq!(status.failed_attempts, 5);
        assert_eq!(status.backup_codes_remaining, 2);

        clock.advance(service.lockout_policy().lockout_duration);
        assert!(!service.status("u1").await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_unlock() {
        let clock = ManualClock::at_unix(59);
        let records = InMemoryRecordStore::new();
        seed_enabled(&records, "u1", &clock).await;
        let service = service_with(records, &clock);

        assert!(matches!(
            service.unlock("ghost").await,
            Err(TwoFactorError::NotFound(_))
        ));
        assert!(!service.unlock("u1").await.unwrap());

        for _ in 0..5 {
            service.verify("u1", "000000").await.unwrap();
        }
        assert!(service.verify("u1", "996554").await.unwrap_err().is_locked());

        assert!(service.unlock("u1").await.unwrap());
        assert!(service.verify("u1", "996554").await.unwrap());
    }

    #[tokio::test]
    async fn test_setup_outcome_debug_redacts_secret() {
        let clock = ManualClock::at_unix(59);
        let service = service_with(InMemoryRecordStore::new(), &clock);
        let outcome = service
            .setup("u1", MethodKind::Authenticator, None)
            .await
            .unwrap();

        let SetupOutcome::Authenticator { ref secret, .. } = outcome else {
            panic!("expected authenticator outcome");
        };
        assert!(!format!("{:?}", outcome).contains(secret.as_str()));
    }
}
