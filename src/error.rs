use std::time::{Duration, SystemTime};

/// The error type for two-factor operations.
///
/// Validation-style errors ([`NotSetUp`](Self::NotSetUp),
/// [`AlreadyEnabled`](Self::AlreadyEnabled), [`InvalidCode`](Self::InvalidCode))
/// never alter persisted state beyond what the failing operation documents.
#[derive(Debug, thiserror::Error)]
pub enum TwoFactorError {
    #[error("Two-factor authentication is not set up")]
    NotSetUp,

    #[error("Two-factor authentication is already enabled")]
    AlreadyEnabled,

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Account locked for {} more seconds", remaining.as_secs())]
    AccountLocked {
        /// When the lockout expires.
        until: SystemTime,
        /// Time left until `until`, measured when the error was raised.
        remaining: Duration,
    },

    #[error("Delivery unavailable: {0}")]
    DeliveryUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl TwoFactorError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn delivery_unavailable(msg: impl Into<String>) -> Self {
        Self::DeliveryUnavailable(msg.into())
    }

    pub fn invalid_contact(msg: impl Into<String>) -> Self {
        Self::InvalidContact(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Build an [`AccountLocked`](Self::AccountLocked) error relative to `now`.
    pub fn locked(until: SystemTime, now: SystemTime) -> Self {
        Self::AccountLocked {
            until,
            remaining: until.duration_since(now).unwrap_or_default(),
        }
    }

    /// Whether the caller can recover by retrying with different input
    /// (or by calling setup first).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotSetUp
                | Self::AlreadyEnabled
                | Self::InvalidCode
                | Self::InvalidContact(_)
                | Self::UnsupportedMethod(_)
        )
    }

    /// Whether this error reports an active lockout.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::AccountLocked { .. })
    }

    /// Seconds until the lockout expires, for user-facing messages.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::AccountLocked { remaining, .. } => Some(remaining.as_secs()),
            _ => None,
        }
    }
}

/// Result type alias for two-factor operations.
pub type Result<T> = std::result::Result<T, TwoFactorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_carries_remaining_time() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let until = now + Duration::from_secs(900);
        let err = TwoFactorError::locked(until, now);

        assert!(err.is_locked());
        assert_eq!(err.retry_after_secs(), Some(900));
        assert_eq!(err.to_string(), "Account locked for 900 more seconds");
    }

    #[test]
    fn test_locked_in_the_past_saturates() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let until = now - Duration::from_secs(5);
        assert_eq!(TwoFactorError::locked(until, now).retry_after_secs(), Some(0));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(TwoFactorError::NotSetUp.is_recoverable());
        assert!(TwoFactorError::AlreadyEnabled.is_recoverable());
        assert!(TwoFactorError::InvalidCode.is_recoverable());
        assert!(!TwoFactorError::Cancelled.is_recoverable());
        assert!(!TwoFactorError::storage("down").is_recoverable());
        assert!(!TwoFactorError::delivery_unavailable("no sms").is_recoverable());
    }
}
