//! Log-safety helpers.
//!
//! Inbound batches hold customer addresses, so anything quoted into a log
//! line goes through [`redact`] first.

use std::sync::LazyLock;

use regex::Regex;

static POSTCODE_MASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2}\b").unwrap());
static LONG_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{5,}\b").unwrap());

const MAX_LEN: usize = 200;

/// Mask postcodes and long digit runs, then cap the length.
///
/// Short digit runs (door numbers, weights) survive; anything five digits or
/// longer is assumed to be a phone number or order reference.
pub fn redact(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let masked = POSTCODE_MASK.replace_all(text, "POSTCODE");
    let masked = LONG_DIGITS.replace_all(&masked, "NUM");

    if masked.chars().count() > MAX_LEN {
        let mut truncated: String = masked.chars().take(MAX_LEN).collect();
        truncated.push('…');
        truncated
    } else {
        masked.into_owned()
    }
}
