//! In-memory stores.
//!
//! Suitable for tests and single-process development. State lives in this
//! process only, so these stores do not give the cross-instance lockout
//! guarantee a shared database does. Clones share the same state.

use super::code::{CodeStore, MarkUsed};
use super::record::{RecordStore, SaveOutcome};
use crate::error::{Result, TwoFactorError};
use crate::record::{OneTimeCode, TwoFactorMethod, TwoFactorRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

fn poisoned<T>(_: T) -> TwoFactorError {
    TwoFactorError::storage("in-memory store lock poisoned")
}

/// In-memory [`RecordStore`] with version checking.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<String, TwoFactorRecord>>>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, user_id: &str) -> Result<Option<TwoFactorRecord>> {
        Ok(self.records.read().map_err(poisoned)?.get(user_id).cloned())
    }

    async fn save(
        &self,
        record: &TwoFactorRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records.get(record.user_id()).map(|r| r.version());

        if current != expected_version {
            return Ok(SaveOutcome::Conflict);
        }

        let version = current.map_or(1, |v| v + 1);
        records.insert(
            record.user_id().to_string(),
            record.clone().with_version(version),
        );
        Ok(SaveOutcome::Saved { version })
    }
}

/// In-memory [`CodeStore`].
#[derive(Clone, Default)]
pub struct InMemoryCodeStore {
    codes: Arc<RwLock<HashMap<String, OneTimeCode>>>,
}

impl InMemoryCodeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All codes issued to a user, oldest first.
    pub fn codes_for(&self, user_id: &str) -> Vec<OneTimeCode> {
        let Ok(codes) = self.codes.read() else {
            return Vec::new();
        };
        let mut found: Vec<OneTimeCode> = codes
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }

    /// Drop codes that expired before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let Ok(mut codes) = self.codes.write() else {
            return 0;
        };
        let before = codes.len();
        codes.retain(|_, c| now < c.expires_at);
        before - codes.len()
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn insert(&self, code: &OneTimeCode) -> Result<()> {
        self.codes
            .write()
            .map_err(poisoned)?
            .insert(code.id.clone(), code.clone());
        Ok(())
    }

    async fn find_unused_unexpired(
        &self,
        user_id: &str,
        code: &str,
        method: &TwoFactorMethod,
        purpose: Option<&str>,
        now: SystemTime,
    ) -> Result<Option<OneTimeCode>> {
        let codes = self.codes.read().map_err(poisoned)?;
        Ok(codes
            .values()
            .filter(|c| c.is_usable_at(now) && c.matches(user_id, code, method, purpose))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn mark_used(&self, code_id: &str) -> Result<MarkUsed> {
        let mut codes = self.codes.write().map_err(poisoned)?;
        let code = codes
            .get_mut(code_id)
            .ok_or_else(|| TwoFactorError::not_found(format!("one-time code {}", code_id)))?;

        if code.is_used {
            return Ok(MarkUsed::AlreadyUsed);
        }
        code.is_used = true;
        Ok(MarkUsed::Marked)
    }
}
