use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Kenyan country prefix expected by the Daraja API.
pub const COUNTRY_PREFIX: &str = "254";

/// Canonical length: `254` followed by nine subscriber digits.
pub const CANONICAL_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid phone number format: {0}")]
pub struct PhoneError(pub String);

/// A phone number in the gateway's canonical international form
/// (`254XXXXXXXXX`). Can only be constructed through [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalPhone(String);

impl CanonicalPhone {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts heterogeneous local phone formats (`07..`, `+2547..`, `7..`,
/// `1..`, with stray spaces or hyphens) into canonical `254XXXXXXXXX` form.
///
/// Idempotent: an already-canonical number passes through unchanged.
pub fn normalize(raw: &str) -> Result<CanonicalPhone, PhoneError> {
    let cleaned: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '-')
        .collect();

    let candidate = if let Some(rest) = cleaned.strip_prefix('0') {
        format!("{}{}", COUNTRY_PREFIX, rest)
    } else if let Some(rest) = cleaned.strip_prefix('+') {
        rest.to_string()
    } else if cleaned.starts_with('7') || cleaned.starts_with('1') {
        format!("{}{}", COUNTRY_PREFIX, cleaned)
    } else {
        cleaned
    };

    if candidate.len() == CANONICAL_LEN
        && candidate.starts_with(COUNTRY_PREFIX)
        && candidate.chars().all(|ch| ch.is_ascii_digit())
    {
        Ok(CanonicalPhone(candidate))
    } else {
        Err(PhoneError(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_zero() {
        assert_eq!(normalize("0712345678").unwrap().as_str(), "254712345678");
        assert_eq!(normalize("0112345678").unwrap().as_str(), "254112345678");
    }

    #[test]
    fn normalizes_plus_prefix() {
        assert_eq!(normalize("+254712345678").unwrap().as_str(), "254712345678");
    }

    #[test]
    fn normalizes_bare_subscriber_prefix() {
        assert_eq!(normalize("712345678").unwrap().as_str(), "254712345678");
        assert_eq!(normalize("112345678").unwrap().as_str(), "254112345678");
    }

    #[test]
    fn strips_whitespace_and_hyphens() {
        assert_eq!(
            normalize(" 0712-345-678 ").unwrap().as_str(),
            "254712345678"
        );
    }

    #[test]
    fn idempotent_on_canonical_input() {
        let canonical = normalize("0712345678").unwrap();
        let again = normalize(canonical.as_str()).unwrap();
        assert_eq!(canonical, again);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(normalize("07123").is_err());
        assert!(normalize("07123456789012").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn rejects_non_digits() {
        assert!(normalize("07123abc78").is_err());
    }

    #[test]
    fn rejects_foreign_prefix() {
        assert!(normalize("+44712345678").is_err());
    }
}
