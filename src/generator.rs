//! Secret, one-time code and backup code generation.
//!
//! All randomness comes from the operating system CSPRNG ([`OsRng`]).

use crate::base32;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// Size of a generated TOTP secret in bytes (160 bits).
pub const SECRET_BYTES: usize = 20;

/// Default number of digits in an SMS/Email one-time code.
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Generate a fresh Base32-encoded TOTP secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base32::encode(&bytes)
}

/// Generate a zero-padded numeric code of `length` digits.
///
/// Four random bytes are read as a `u32` and reduced modulo `10^length`.
pub fn generate_numeric_code(length: usize) -> String {
    let value = u64::from(OsRng.next_u32());
    let value = match 10u64.checked_pow(length as u32) {
        Some(modulus) => value % modulus,
        None => value,
    };
    format!("{:0width$}", value, width = length)
}

/// A freshly generated set of backup codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupCodes {
    /// Codes in `XXXX-XXXX` form (plaintext; see the crate docs on storage).
    pub codes: Vec<String>,
}

impl BackupCodes {
    /// Number of codes in the set.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Consume the set, returning the codes.
    pub fn into_vec(self) -> Vec<String> {
        self.codes
    }
}

/// Generates grouped-hex backup codes.
#[derive(Clone, Debug)]
pub struct BackupCodeGenerator {
    /// Number of codes to generate (default: 10).
    pub count: usize,
}

impl Default for BackupCodeGenerator {
    fn default() -> Self {
        Self { count: 10 }
    }
}

impl BackupCodeGenerator {
    /// Create a new backup code generator with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of codes to generate.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Generate a new set of backup codes.
    pub fn generate(&self) -> BackupCodes {
        BackupCodes {
            codes: (0..self.count).map(|_| generate_backup_code()).collect(),
        }
    }

    /// Find `code` in `valid_codes`.
    ///
    /// Hyphens, whitespace and case are ignored on both sides. Returns the
    /// index of the matched code so it can be removed.
    pub fn verify(code: &str, valid_codes: &[String]) -> Option<usize> {
        let submitted = normalize_backup_code(code);
        if submitted.is_empty() {
            return None;
        }

        valid_codes.iter().position(|candidate| {
            let candidate = normalize_backup_code(candidate);
            bool::from(candidate.as_bytes().ct_eq(submitted.as_bytes()))
        })
    }
}

/// Generate a single `XXXX-XXXX` backup code from five random bytes.
pub fn generate_backup_code() -> String {
    let mut bytes = [0u8; 5];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!("{}-{}", &hex[..4], &hex[4..8])
}

fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
