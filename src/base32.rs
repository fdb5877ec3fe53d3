//! RFC 4648 Base32 codec for shared secrets.
//!
//! Encoding is uppercase and unpadded. Decoding is deliberately lenient: it is
//! case-insensitive and skips any character outside the alphabet, so secrets
//! copied with spaces, dashes or `=` padding still decode. Malformed input
//! never errors; it decodes to a shorter (possibly empty) byte sequence.

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Encode bytes as unpadded uppercase Base32.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1F;
            out.push(ALPHABET[index as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }

    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1F;
        out.push(ALPHABET[index as usize] as char);
    }

    out
}

/// Decode Base32, skipping characters outside the alphabet.
///
/// Trailing bits that do not complete a byte are dropped.
pub fn decode(input: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((input.len() * 5 / 8).max(16));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for c in input.bytes() {
        let Some(value) = symbol_value(c) else {
            continue;
        };

        buffer = (buffer << 5) | u32::from(value);
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    out
}

fn symbol_value(c: u8) -> Option<u8> {
    match c.to_ascii_uppercase() {
        c @ b'A'..=b'Z' => Some(c - b'A'),
        c @ b'2'..=b'7' => Some(c - b'2' + 26),
        _ => None,
    }
}
