//! License plate canonicalization.
//!
//! Plates arrive from agencies in every imaginable shape ("abc 123",
//! "ABC-123", "abc·123"). Reliable comparison needs one canonical form:
//! uppercase with everything outside `[A-Z0-9]` stripped.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlateError {
    /// Canonical plate must be 2..=10 characters.
    #[error("plate length {0} outside 2..=10 after canonicalization")]
    BadLength(usize),
    /// Plate state must be a 2-letter code.
    #[error("invalid plate state: {0:?}")]
    BadState(String),
}

/// Uppercase and strip all non-alphanumeric characters.
///
/// Rejects results whose length falls outside `[2, 10]`.
pub fn canonicalize_plate(raw: &str) -> Result<String, PlateError> {
    let canonical: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if !(2..=10).contains(&canonical.len()) {
        return Err(PlateError::BadLength(canonical.len()));
    }
    Ok(canonical)
}

/// Uppercase 2-letter jurisdiction code. Required on every event.
pub fn canonicalize_plate_state(raw: &str) -> Result<String, PlateError> {
    let trimmed = raw.trim();
    if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(PlateError::BadState(raw.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_separators_and_uppercases() {
        assert_eq!(canonicalize_plate("abc 123").unwrap(), "ABC123");
        assert_eq!(canonicalize_plate("AbC-12_3").unwrap(), "ABC123");
        assert_eq!(canonicalize_plate(" 7xy z99 ").unwrap(), "7XYZ99");
    }

    #[test]
    fn rejects_too_short_and_too_long() {
        assert_eq!(canonicalize_plate("a"), Err(PlateError::BadLength(1)));
        assert_eq!(canonicalize_plate("--"), Err(PlateError::BadLength(0)));
        assert_eq!(
            canonicalize_plate("ABCDEFGHIJK"),
            Err(PlateError::BadLength(11))
        );
    }

    #[test]
    fn boundary_lengths_accepted() {
        assert_eq!(canonicalize_plate("ab").unwrap(), "AB");
        assert_eq!(canonicalize_plate("ABCDEFGHIJ").unwrap(), "ABCDEFGHIJ");
    }

    #[test]
    fn state_codes() {
        assert_eq!(canonicalize_plate_state("ca").unwrap(), "CA");
        assert_eq!(canonicalize_plate_state(" ny ").unwrap(), "NY");
        assert!(canonicalize_plate_state("cal").is_err());
        assert!(canonicalize_plate_state("c1").is_err());
        assert!(canonicalize_plate_state("").is_err());
    }
}
