//! TOTP (Time-based One-Time Password) engine.
//!
//! Codes are six-digit HMAC-SHA1 values over the big-endian time step, as in
//! RFC 6238. Verification accepts the previous, current and next step.

use crate::base32;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Number of digits in a TOTP code.
pub const TOTP_DIGITS: usize = 6;

/// Canonical time step in seconds.
pub const DEFAULT_TIME_STEP: u64 = 30;

/// Step offsets accepted during verification, in the order they are tried.
pub const SKEW_OFFSETS: [i64; 3] = [-1, 0, 1];

const MODULUS: u32 = 1_000_000;

/// Reasons a code could not be computed.
///
/// These never escape [`TotpEngine::verify`]; a failed computation is
/// indistinguishable from a wrong code there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    #[error("secret decodes to no key material")]
    EmptyKey,
    #[error("time step must be greater than zero")]
    ZeroTimeStep,
    #[error("time is before the unix epoch")]
    BeforeEpoch,
}

/// Computes and verifies TOTP codes for a fixed time-step size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TotpEngine {
    time_step: u64,
}

impl Default for TotpEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_STEP)
    }
}

impl TotpEngine {
    /// Create an engine with the given time step in seconds.
    pub fn new(time_step_secs: u64) -> Self {
        Self {
            time_step: time_step_secs,
        }
    }

    /// The configured time step in seconds.
    pub fn time_step(&self) -> u64 {
        self.time_step
    }

    /// The time step index containing `unix_secs`.
    pub fn step_at(&self, unix_secs: u64) -> Result<u64, TotpError> {
        if self.time_step == 0 {
            return Err(TotpError::ZeroTimeStep);
        }
        Ok(unix_secs / self.time_step)
    }

    /// Compute the code for an explicit time step index.
    pub fn code_for_step(&self, secret: &str, step: u64) -> Result<String, TotpError> {
        let key = base32::decode(secret);
        if key.is_empty() {
            return Err(TotpError::EmptyKey);
        }
        Ok(format_code(truncate(&key, step)))
    }

    /// Compute the code valid at `unix_secs`.
    pub fn generate_at(&self, secret: &str, unix_secs: u64) -> Result<String, TotpError> {
        self.code_for_step(secret, self.step_at(unix_secs)?)
    }

    /// Compute the code valid at `now`.
    pub fn generate(&self, secret: &str, now: SystemTime) -> Result<String, TotpError> {
        self.generate_at(secret, unix_seconds(now)?)
    }

    /// Find which accepted offset (if any) produces `code` at `unix_secs`.
    ///
    /// Offsets are tried in [`SKEW_OFFSETS`] order. Offset `-1` is skipped at
    /// step 0.
    pub fn matching_offset_at(
        &self,
        secret: &str,
        code: &str,
        unix_secs: u64,
    ) -> Result<Option<i64>, TotpError> {
        let code = normalize_code(code);
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }

        let key = base32::decode(secret);
        if key.is_empty() {
            return Err(TotpError::EmptyKey);
        }

        let current = self.step_at(unix_secs)?;
        for offset in SKEW_OFFSETS {
            let Some(step) = current.checked_add_signed(offset) else {
                continue;
            };
            let candidate = format_code(truncate(&key, step));
            if bool::from(candidate.as_bytes().ct_eq(code.as_bytes())) {
                return Ok(Some(offset));
            }
        }

        Ok(None)
    }

    /// Verify `code` at `unix_secs`, treating any computation error as a mismatch.
    pub fn verify_at(&self, secret: &str, code: &str, unix_secs: u64) -> bool {
        match self.matching_offset_at(secret, code, unix_secs) {
            Ok(offset) => offset.is_some(),
            Err(e) => {
                tracing::debug!(
                    target: "two_factor.totp",
                    error = %e,
                    "TOTP computation failed, treating as mismatch"
                );
                false
            }
        }
    }

    /// Verify `code` at `now`.
    pub fn verify(&self, secret: &str, code: &str, now: SystemTime) -> bool {
        match unix_seconds(now) {
            Ok(secs) => self.verify_at(secret, code, secs),
            Err(_) => false,
        }
    }
}

/// Seconds since the unix epoch.
pub fn unix_seconds(time: SystemTime) -> Result<u64, TotpError> {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TotpError::BeforeEpoch)
}

/// Build the `otpauth://` URI understood by authenticator apps.
pub fn provisioning_uri(issuer: &str, account: &str, secret: &str) -> String {
    let issuer = encode_component(issuer);
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}",
        account = encode_component(account),
        secret = encode_component(secret),
    )
}

fn encode_component(value: &str) -> String {
    // form encoding turns spaces into '+', which authenticators read literally
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Strip whitespace and dashes users paste along with a code.
pub(crate) fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

fn truncate(key: &[u8], step: u64) -> u32 {
    let hash = hmac_sha1(key, &step.to_be_bytes());
    let offset = (hash[19] & 0x0F) as usize;
    (u32::from(hash[offset] & 0x7F) << 24)
        | (u32::from(hash[offset + 1]) << 16)
        | (u32::from(hash[offset + 2]) << 8)
        | u32::from(hash[offset + 3])
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length; new_from_slice cannot fail here.
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 20],
    };
    mac.update(message);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn format_code(binary: u32) -> String {
    format!("{:0width$}", binary % MODULUS, width = TOTP_DIGITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // RFC 6238 appendix B key "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
    const EXAMPLE_SECRET: &str = "JBSWY3DPEHPK3PXP";

    #[test]
    fn test_rfc6238_sha1_vectors() {
        let engine = TotpEngine::default();
        assert_eq!(engine.generate_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(engine.generate_at(RFC_SECRET, 1_111_111_109).unwrap(), "081804");
        assert_eq!(engine.generate_at(RFC_SECRET, 1_111_111_111).unwrap(), "050471");
        assert_eq!(engine.generate_at(RFC_SECRET, 1_234_567_890).unwrap(), "005924");
        assert_eq!(engine.generate_at(RFC_SECRET, 2_000_000_000).unwrap(), "279037");
        assert_eq!(engine.generate_at(RFC_SECRET, 20_000_000_000).unwrap(), "353130");
    }

    #[test]
    fn test_example_secret_at_59_seconds() {
        let engine = TotpEngine::new(30);
        assert_eq!(engine.step_at(59).unwrap(), 1);
        assert_eq!(engine.generate_at(EXAMPLE_SECRET, 59).unwrap(), "996554");
        assert_eq!(engine.code_for_step(EXAMPLE_SECRET, 0).unwrap(), "282760");
        assert_eq!(engine.code_for_step(EXAMPLE_SECRET, 2).unwrap(), "602287");
    }

    #[test]
    fn test_generation_is_deterministic() {
        let engine = TotpEngine::default();
        let a = engine.generate_at(EXAMPLE_SECRET, 1_700_000_000).unwrap();
        let b = engine.generate_at(EXAMPLE_SECRET, 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), TOTP_DIGITS);
    }

    #[test]
    fn test_window_accepts_adjacent_steps() {
        let engine = TotpEngine::default();
        // Step 2 code, verified from steps 1, 2 and 3.
        let code = "602287";
        assert_eq!(engine.matching_offset_at(EXAMPLE_SECRET, code, 45).unwrap(), Some(1));
        assert_eq!(engine.matching_offset_at(EXAMPLE_SECRET, code, 60).unwrap(), Some(0));
        assert_eq!(engine.matching_offset_at(EXAMPLE_SECRET, code, 119).unwrap(), Some(-1));
        assert!(engine.verify_at(EXAMPLE_SECRET, code, 89));
    }

    #[test]
    fn test_window_rejects_two_steps_away() {
        let engine = TotpEngine::default();
        let code = engine.code_for_step(EXAMPLE_SECRET, 10).unwrap();
        assert!(engine.verify_at(EXAMPLE_SECRET, &code, 10 * 30));
        assert!(!engine.verify_at(EXAMPLE_SECRET, &code, 12 * 30));
        assert!(!engine.verify_at(EXAMPLE_SECRET, &code, 8 * 30 + 29));
    }

    #[test]
    fn test_step_zero_skips_negative_offset() {
        let engine = TotpEngine::default();
        assert_eq!(
            engine.matching_offset_at(EXAMPLE_SECRET, "282760", 0).unwrap(),
            Some(0)
        );
        assert!(engine.verify_at(EXAMPLE_SECRET, "996554", 0));
    }

    #[test]
    fn test_code_with_spaces_and_dashes() {
        let engine = TotpEngine::default();
        assert!(engine.verify_at(EXAMPLE_SECRET, "996 554", 59));
        assert!(engine.verify_at(EXAMPLE_SECRET, " 996-554 ", 59));
    }

    #[test]
    fn test_malformed_codes_rejected() {
        let engine = TotpEngine::default();
        assert!(!engine.verify_at(EXAMPLE_SECRET, "99655", 59));
        assert!(!engine.verify_at(EXAMPLE_SECRET, "9965540", 59));
        assert!(!engine.verify_at(EXAMPLE_SECRET, "99655a", 59));
        assert!(!engine.verify_at(EXAMPLE_SECRET, "", 59));
    }

    #[test]
    fn test_invalid_secret_never_matches() {
        let engine = TotpEngine::default();
        assert_eq!(engine.generate_at("0189!!", 59), Err(TotpError::EmptyKey));
        assert!(!engine.verify_at("0189!!", "000000", 59));
        assert!(!engine.verify_at("", "996554", 59));
    }

    #[test]
    fn test_zero_time_step_never_matches() {
        let engine = TotpEngine::new(0);
        assert_eq!(engine.step_at(59), Err(TotpError::ZeroTimeStep));
        assert!(!engine.verify_at(EXAMPLE_SECRET, "996554", 59));
    }

    #[test]
    fn test_verify_with_system_time() {
        let engine = TotpEngine::default();
        let now = UNIX_EPOCH + Duration::from_secs(59);
        assert_eq!(engine.generate(EXAMPLE_SECRET, now).unwrap(), "996554");
        assert!(engine.verify(EXAMPLE_SECRET, "996554", now));
        assert!(!engine.verify(EXAMPLE_SECRET, "996554", UNIX_EPOCH - Duration::from_secs(1)));
    }

    #[test]
    fn test_provisioning_uri() {
        let uri = provisioning_uri("MyApp", "user@example.com", EXAMPLE_SECRET);
        assert_eq!(
            uri,
            "otpauth://totp/MyApp:user%40example.com?secret=JBSWY3DPEHPK3PXP&issuer=MyApp"
        );
    }

    #[test]
    fn test_provisioning_uri_escapes_spaces() {
        let uri = provisioning_uri("My App", "jane doe", EXAMPLE_SECRET);
        assert!(uri.starts_with("otpauth://totp/My%20App:jane%20doe?"));
        assert!(uri.ends_with("&issuer=My%20App"));
    }
}
