//! Console delivery for development.
//!
//! # Security Warning
//!
//! This channel writes messages to stdout, which container platforms often
//! capture into logs. **Do not use in production.** Message bodies (which
//! contain the code) are redacted unless full output is enabled explicitly.

use super::{DeliveryChannel, DeliveryError};
use async_trait::async_trait;

/// A channel that prints SMS and email messages instead of sending them.
///
/// # Example
///
/// ```rust
/// use second_factor::delivery::ConsoleDelivery;
///
/// // Default: redacts message bodies
/// let channel = ConsoleDelivery::new();
///
/// // Development only: show codes on stdout
/// let channel = ConsoleDelivery::new().with_full_output(true);
/// ```
#[derive(Debug, Clone)]
pub struct ConsoleDelivery {
    prefix: String,
    show_full_content: bool,
}

impl ConsoleDelivery {
    /// Create a console channel that redacts message bodies.
    pub fn new() -> Self {
        Self {
            prefix: "[2FA]".to_string(),
            show_full_content: false,
        }
    }

    /// Create a console channel with a custom line prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            show_full_content: false,
        }
    }

    /// Enable or disable printing message bodies (including codes).
    pub fn with_full_output(mut self, enabled: bool) -> Self {
        if enabled {
            tracing::warn!(
                "ConsoleDelivery: full output enabled - verification codes will be visible in logs. \
                 Do not use in production!"
            );
        }
        self.show_full_content = enabled;
        self
    }

    fn body(&self, body: &str) -> String {
        if self.show_full_content {
            body.to_string()
        } else {
            format!("{} bytes [REDACTED]", body.len())
        }
    }
}

impl Default for ConsoleDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleDelivery {
    async fn send_sms(&self, phone: &str, text: &str) -> Result<(), DeliveryError> {
        println!("{} SMS to {}: {}", self.prefix, phone, self.body(text));
        Ok(())
    }

    async fn send_email(&self, address: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        println!("{} ════════════════════════════════════════", self.prefix);
        println!("{} To:      {}", self.prefix, address);
        println!("{} Subject: {}", self.prefix, subject);
        println!("{} ────────────────────────────────────────", self.prefix);
        for line in self.body(body).lines() {
            println!("{} {}", self.prefix, line);
        }
        println!("{} ════════════════════════════════════════", self.prefix);
        Ok(())
    }
}
