//! Identifier grammars shared by the execution service and the sandboxes.

use once_cell::sync::Lazy;
use regex::Regex;

static SAFE_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z_]{1,64}$").unwrap());
static IMAGE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{64}$").unwrap());

/// File and repository names must pass this check before they go anywhere
/// near a sandbox. Safe identifiers are 1-64 ASCII letters, digits or
/// underscores.
pub fn is_safe_identifier(s: &str) -> bool {
    SAFE_IDENT.is_match(s)
}

/// Image ids are exactly 64 lowercase hex characters.
pub fn is_valid_image_id(s: &str) -> bool {
    IMAGE_ID.is_match(s)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn safe_identifiers() {
        assert!(is_safe_identifier("binary"));
        assert!(is_safe_identifier("stdout"));
        assert!(is_safe_identifier("a"));
        assert!(is_safe_identifier("Test_42"));
        assert!(is_safe_identifier(&"x".repeat(64)));
    }

    #[test]
    fn unsafe_identifiers() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier(&"x".repeat(65)));
        assert!(!is_safe_identifier("has space"));
        assert!(!is_safe_identifier("dot.txt"));
        assert!(!is_safe_identifier("../escape"));
        assert!(!is_safe_identifier("dash-ed"));
        // Word characters mean ASCII here, not Unicode.
        assert!(!is_safe_identifier("störung"));
    }

    #[test]
    fn image_ids() {
        assert!(is_valid_image_id(&"0123456789abcdef".repeat(4)));
        assert!(!is_valid_image_id(&"0123456789ABCDEF".repeat(4)));
        assert!(!is_valid_image_id(&"0123456789abcdef".repeat(2)));
        assert!(!is_valid_image_id(""));
        assert!(!is_valid_image_id(&"g".repeat(64)));
    }
}
