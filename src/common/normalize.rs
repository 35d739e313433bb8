use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Largest identifier accepted from clients (`i64::MAX`), kept as text so the
/// comparison never goes through a native integer.
pub const ID_CEILING: &str = "9223372036854775807";

/// Magnitude of `i64::MIN`.
const NATIVE_MIN_MAGNITUDE: &str = "9223372036854775808";

static INTEGER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?)([0-9]+)$").expect("integer pattern is valid"));

static DIGITS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("digits pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid integer format: {0:?}")]
    InvalidFormat(String),
}

/// Canonical decimal form of an integer-valued input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegerString {
    canonical: String,
    fits_native: bool,
}

impl IntegerString {
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn into_string(self) -> String {
        self.canonical
    }

    /// True when the value can be held by an `i64` without loss.
    pub fn fits_native(&self) -> bool {
        self.fits_native
    }

    pub fn is_negative(&self) -> bool {
        self.canonical.starts_with('-')
    }

    pub fn is_zero(&self) -> bool {
        self.canonical == "0"
    }

    pub fn is_positive(&self) -> bool {
        !self.is_negative() && !self.is_zero()
    }

    /// Non-negative and not above [`ID_CEILING`].
    pub fn within_ceiling(&self) -> bool {
        !self.is_negative() && compare_magnitude(&self.canonical, ID_CEILING) != Ordering::Greater
    }
}

/// Trimmed text for string input; anything else becomes the empty string.
pub fn normalize_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        _ => String::new(),
    }
}

pub fn normalize_field(value: Option<&Value>) -> String {
    value.map(normalize_string).unwrap_or_default()
}

/// Canonicalizes `-?[0-9]+`: leading zeros are stripped from the magnitude
/// and `-0` collapses to `0`.
pub fn normalize_integer_string(raw: &str) -> Result<IntegerString, NormalizeError> {
    let captures = INTEGER_PATTERN
        .captures(raw)
        .ok_or_else(|| NormalizeError::InvalidFormat(raw.to_string()))?;

    let magnitude = captures[2].trim_start_matches('0');
    let magnitude = if magnitude.is_empty() { "0" } else { magnitude };
    let negative = !captures[1].is_empty() && magnitude != "0";

    let bound = if negative {
        NATIVE_MIN_MAGNITUDE
    } else {
        ID_CEILING
    };
    let fits_native = compare_magnitude(magnitude, bound) != Ordering::Greater;

    let canonical = if negative {
        format!("-{magnitude}")
    } else {
        magnitude.to_string()
    };

    Ok(IntegerString {
        canonical,
        fits_native,
    })
}

pub fn is_digits(text: &str) -> bool {
    DIGITS_PATTERN.is_match(text)
}

/// Orders two unsigned decimal magnitudes without leading zeros.
pub fn compare_magnitude(left: &str, right: &str) -> Ordering {
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_leading_zeros() {
        let value = normalize_integer_string("000123").unwrap();
        assert_eq!(value.as_str(), "123");
        assert!(value.fits_native());
        assert!(value.is_positive());
    }

    #[test]
    fn empty_magnitude_becomes_zero() {
        assert_eq!(normalize_integer_string("0000").unwrap().as_str(), "0");
        let negative_zero = normalize_integer_string("-000").unwrap();
        assert_eq!(negative_zero.as_str(), "0");
        assert!(!negative_zero.is_negative());
        assert!(negative_zero.is_zero());
    }

    #[test]
    fn native_bounds_are_inclusive() {
        let max = normalize_integer_string("9223372036854775807").unwrap();
        assert!(max.fits_native());
        assert!(max.within_ceiling());

        let above = normalize_integer_string("9223372036854775808").unwrap();
        assert!(!above.fits_native());
        assert!(!above.within_ceiling());
        assert_eq!(above.as_str(), "9223372036854775808");

        let min = normalize_integer_string("-9223372036854775808").unwrap();
        assert!(min.fits_native());
        assert!(min.is_negative());

        let below = normalize_integer_string("-9223372036854775809").unwrap();
        assert!(!below.fits_native());
    }

    #[test]
    fn huge_values_keep_every_digit() {
        let raw = "123456789012345678901234567890";
        let value = normalize_integer_string(raw).unwrap();
        assert_eq!(value.as_str(), raw);
        assert!(!value.fits_native());
    }

    #[test]
    fn rejects_non_integer_input() {
        for raw in ["", "-", "12a", " 12", "1.5", "+3", "1e5"] {
            assert_eq!(
                normalize_integer_string(raw),
                Err(NormalizeError::InvalidFormat(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn normalize_string_trims_and_drops_non_strings() {
        assert_eq!(normalize_string(&json!("  hi there ")), "hi there");
        assert_eq!(normalize_string(&json!(42)), "");
        assert_eq!(normalize_string(&json!(null)), "");
        assert_eq!(normalize_field(None), "");
    }

    #[test]
    fn digit_check() {
        assert!(is_digits("007"));
        assert!(!is_digits(""));
        assert!(!is_digits("-7"));
        assert!(!is_digits("7 "));
    }
}
