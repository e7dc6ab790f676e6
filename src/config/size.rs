//! Human readable byte sizes (`10b`, `1KB`, `5mb`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("invalid size {0:?}: expected a number followed by b, kb, mb or gb")]
    Invalid(String),

    #[error("size {0:?} overflows")]
    Overflow(String),
}

/// Parse a size into bytes. Units are binary and case-insensitive.
///
/// An empty string, `"0"` and any negative size all yield `0`, which callers treat
/// as "no limit".
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let (negative, magnitude) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };

    let lower = magnitude.to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(split);
    if digits.is_empty() {
        return Err(SizeError::Invalid(input.to_string()));
    }

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        _ => return Err(SizeError::Invalid(input.to_string())),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| SizeError::Overflow(input.to_string()))?;
    if negative {
        return Ok(0);
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| SizeError::Overflow(input.to_string()))
}
