//! Two-factor record storage trait.

use crate::error::Result;
use crate::record::TwoFactorRecord;
use async_trait::async_trait;

/// Outcome of a conditional save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The record was written; `version` is its new stored version.
    Saved { version: u64 },
    /// The stored version no longer matched the expected one.
    Conflict,
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Persistence for [`TwoFactorRecord`]s, one per user.
///
/// # Optimistic concurrency
///
/// `save` must be an atomic compare-and-swap on the record version:
///
/// - `expected_version: None` inserts only if no record exists for the user.
/// - `expected_version: Some(v)` writes only if the stored version is `v`.
///
/// On success the store assigns and returns a new version (any value different
/// from the previous one; the in-memory store increments). Examples:
///
/// - **PostgreSQL**: `UPDATE two_factor SET ..., version = version + 1
///   WHERE user_id = $1 AND version = $2 RETURNING version`
/// - **Redis**: `WATCH`/`MULTI`/`EXEC`
/// - **DynamoDB**: conditional writes with `ConditionExpression`
///
/// # Example
///
/// ```rust,ignore
/// use second_factor::storage::{RecordStore, SaveOutcome};
/// use async_trait::async_trait;
///
/// struct PgRecordStore {
///     pool: PgPool,
/// }
///
/// #[async_trait]
/// impl RecordStore for PgRecordStore {
///     async fn get(&self, user_id: &str) -> Result<Option<TwoFactorRecord>> {
///         // SELECT ... WHERE user_id = $1
///     }
///
///     // ... implement save
/// }
/// ```
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load the record for a user.
    async fn get(&self, user_id: &str) -> Result<Option<TwoFactorRecord>>;

    /// Conditionally write a record (see the trait docs).
    async fn save(
        &self,
        record: &TwoFactorRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome>;
}
