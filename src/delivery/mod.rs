//! Out-of-band delivery of one-time codes.
//!
//! The service hands codes to a [`DeliveryChannel`] and does not wait for
//! delivery receipts. A channel that cannot send surfaces
//! [`TwoFactorError::DeliveryUnavailable`], which is never conflated with a
//! wrong code.

mod console;
mod recording;

pub use console::ConsoleDelivery;
pub use recording::{RecordingDelivery, SentMessage};

use crate::error::TwoFactorError;
use crate::record::MethodKind;
use async_trait::async_trait;
use std::time::Duration;

/// Failure reported by a delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("{0} delivery is not configured")]
    NotConfigured(MethodKind),
    #[error("delivery failed: {0}")]
    Failed(String),
}

impl From<DeliveryError> for TwoFactorError {
    fn from(err: DeliveryError) -> Self {
        TwoFactorError::DeliveryUnavailable(err.to_string())
    }
}

/// Sends SMS and email messages.
///
/// Both methods default to [`DeliveryError::NotConfigured`], so a channel only
/// needs to implement the transports it supports.
///
/// # Example
///
/// ```rust,ignore
/// use second_factor::delivery::{DeliveryChannel, DeliveryError};
/// use async_trait::async_trait;
///
/// struct TwilioChannel {
///     client: TwilioClient,
/// }
///
/// #[async_trait]
/// impl DeliveryChannel for TwilioChannel {
///     async fn send_sms(&self, phone: &str, text: &str) -> Result<(), DeliveryError> {
///         self.client
///             .send(phone, text)
///             .await
///             .map_err(|e| DeliveryError::Failed(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Send a text message.
    async fn send_sms(&self, phone: &str, text: &str) -> Result<(), DeliveryError> {
        let _ = (phone, text);
        Err(DeliveryError::NotConfigured(MethodKind::Sms))
    }

    /// Send an email.
    async fn send_email(&self, address: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let _ = (address, subject, body);
        Err(DeliveryError::NotConfigured(MethodKind::Email))
    }
}

/// A channel with no transports configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDelivery;

impl DeliveryChannel for NoDelivery {}

/// Text of a code message for each transport.
#[derive(Clone, Debug)]
pub struct CodeMessage<'a> {
    pub code: &'a str,
    pub issuer: &'a str,
    pub ttl: Duration,
}

impl CodeMessage<'_> {
    fn minutes(&self) -> u64 {
        self.ttl.as_secs().div_ceil(60).max(1)
    }

    pub fn sms_text(&self) -> String {
        format!(
            "{} verification code: {}. It expires in {} minutes.",
            self.issuer,
            self.code,
            self.minutes()
        )
    }

    pub fn email_subject(&self) -> String {
        format!("Your {} verification code", self.issuer)
    }

    pub fn email_body(&self) -> String {
        format!(
            "Your verification code is {}.\n\n\
             It expires in {} minutes. If you did not request this code, \
             you can ignore this email.",
            self.code,
            self.minutes()
        )
    }
}

/// Mask a phone number or email address for display.
///
/// `+15551234567` becomes `+1******4567`; `jane@example.com` becomes
/// `j***@example.com`.
pub fn mask_contact(kind: MethodKind, contact: &str) -> String {
    match kind {
        MethodKind::Email => match contact.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                format!("{}***@{}", first, domain)
            }
            None => "***".to_string(),
        },
        _ => {
            let chars: Vec<char> = contact.chars().collect();
            if chars.len() <= 6 {
                return "*".repeat(chars.len());
            }
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}{}{}", head, "*".repeat(chars.len() - 6), tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_delivery_is_not_configured() {
        let channel = NoDelivery;
        assert_eq!(
            channel.send_sms("+15550000000", "hi").await,
            Err(DeliveryError::NotConfigured(MethodKind::Sms))
        );
        let err: TwoFactorError = channel
            .send_email("a@example.com", "s", "b")
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, TwoFactorError::DeliveryUnavailable(_)));
    }

    #[test]
    fn test_message_templates() {
        let message = CodeMessage {
            code: "042137",
            issuer: "Acme",
            ttl: Duration::from_secs(600),
        };
        assert_eq!(
            message.sms_text(),
            "Acme verification code: 042137. It expires in 10 minutes."
        );
        assert_eq!(message.email_subject(), "Your Acme verification code");
        assert!(message.email_body().contains("042137"));
    }

    #[test]
    fn test_mask_contact() {
        assert_eq!(mask_contact(MethodKind::Sms, "+15551234567"), "+1******4567");
        assert_eq!(mask_contact(MethodKind::Sms, "12345"), "*****");
        assert_eq!(
            mask_contact(MethodKind::Email, "jane@example.com"),
            "j***@example.com"
        );
        assert_eq!(mask_contact(MethodKind::Email, "broken"), "***");
    }
}
