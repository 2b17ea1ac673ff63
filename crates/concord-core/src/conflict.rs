//! # conflict
//!
//! why: pick one winner when two committed narrative versions disagree
//! relations: pure function, called directly by the facade without touching node state
//! what: resolve_conflict (information-content tie-break)

/// Deterministic tie-break between two narrative versions.
///
/// The version with strictly more characters wins; on equal length the
/// second argument wins. The result depends only on the arguments, so every
/// node picks the same winner for the same ordered pair. It is not
/// commutative for distinct equal-length inputs.
pub fn resolve_conflict<'a>(version_a: &'a str, version_b: &'a str) -> &'a str {
    if version_a.chars().count() > version_b.chars().count() {
        version_a
    } else {
        version_b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longer_version_wins() {
        assert_eq!(resolve_conflict("the knight fell", "the knight"), "the knight fell");
        assert_eq!(resolve_conflict("a", "abc"), "abc");
    }

    #[test]
    fn equal_inputs_are_idempotent() {
        assert_eq!(resolve_conflict("same", "same"), "same");
        assert_eq!(resolve_conflict("", ""), "");
    }

    #[test]
    fn equal_length_prefers_second() {
        assert_eq!(resolve_conflict("abc", "xyz"), "xyz");
        assert_eq!(resolve_conflict("xyz", "abc"), "abc");
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 3 chars / 6 bytes vs 4 chars / 4 bytes
        assert_eq!(resolve_conflict("äöü", "abcd"), "abcd");
    }
}
