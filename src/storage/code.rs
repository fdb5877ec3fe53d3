//! One-time code storage trait.

use crate::error::Result;
use crate::record::{OneTimeCode, TwoFactorMethod};
use async_trait::async_trait;
use std::time::SystemTime;

/// Outcome of consuming a one-time code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkUsed {
    /// The code was unused and is now marked used.
    Marked,
    /// Another request consumed the code first.
    AlreadyUsed,
}

/// Persistence for issued SMS/Email challenge codes.
///
/// Expired rows are never purged here; that is left to housekeeping. They
/// must simply never be returned by [`find_unused_unexpired`](Self::find_unused_unexpired).
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Store a newly issued code.
    async fn insert(&self, code: &OneTimeCode) -> Result<()>;

    /// Find an unused code for `user_id` equal to `code` with `expires_at > now`,
    /// sent through `method` to its current contact, optionally restricted to
    /// `purpose`. See [`OneTimeCode::matches`].
    async fn find_unused_unexpired(
        &self,
        user_id: &str,
        code: &str,
        method: &TwoFactorMethod,
        purpose: Option<&str>,
        now: SystemTime,
    ) -> Result<Option<OneTimeCode>>;

    /// Atomically mark a code used.
    ///
    /// Must be a single conditional update (`... SET is_used = true WHERE id = $1
    /// AND is_used = false`) so two concurrent requests cannot both consume it.
    async fn mark_used(&self, code_id: &str) -> Result<MarkUsed>;
}
