//! Identifier validation for schema declarations.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
    })
}

/// Check that `name` is usable as an entity, table or column identifier.
///
/// Accepts ASCII letters, digits and underscores, not starting with a digit,
/// at most 63 characters.
///
/// # Examples
///
/// ```
/// use rowmap_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("CourseDetails"));
/// assert!(is_valid_identifier("is_deleted"));
/// assert!(!is_valid_identifier("1course"));
/// assert!(!is_valid_identifier("course; drop"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("id"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("STUDENT_COURSE"));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("course name"));
        assert!(!is_valid_identifier("a\"b"));
        assert!(!is_valid_identifier(&"x".repeat(64)));
    }
}
