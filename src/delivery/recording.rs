//! A channel that records messages in memory, for tests.

use super::{DeliveryChannel, DeliveryError};
use crate::record::MethodKind;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// A message captured by [`RecordingDelivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub kind: MethodKind,
    pub destination: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Records every message instead of sending it. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingDelivery {
    sent: Arc<RwLock<Vec<SentMessage>>>,
    failure: Arc<RwLock<Option<String>>>,
}

impl RecordingDelivery {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = Some(reason.into());
        }
    }

    /// Let sends succeed again.
    pub fn recover(&self) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = None;
        }
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// The most recent message sent to `destination`.
    pub fn last_to(&self, destination: &str) -> Option<SentMessage> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.destination == destination)
    }

    fn record(&self, message: SentMessage) -> Result<(), DeliveryError> {
        if let Some(reason) = self.failure.read().ok().and_then(|f| f.clone()) {
            return Err(DeliveryError::Failed(reason));
        }
        self.sent
            .write()
            .map_err(|_| DeliveryError::Failed("recorder lock poisoned".to_string()))?
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn send_sms(&self, phone: &str, text: &str) -> Result<(), DeliveryError> {
        self.record(SentMessage {
            kind: MethodKind::Sms,
            destination: phone.to_string(),
            subject: None,
            body: text.to_string(),
        })
    }

    async fn send_email(&self, address: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        self.record(SentMessage {
            kind: MethodKind::Email,
            destination: address.to_string(),
            subject: Some(subject.to_string()),
            body: body.to_string(),
        })
    }
}
