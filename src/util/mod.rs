//! Small helpers shared across the crate.
//!
//! - **URL validation**: feed URLs must be http(s) and, unless configured
//!   otherwise, must not point at loopback or private networks
//! - **Label cleanup**: owner-supplied names are trimmed and stripped of
//!   control characters before they are stored

mod url_validator;

pub use url_validator::{site_origin, validate_feed_url, UrlValidationError};

/// Trim a user supplied label and drop control characters.
///
/// Returns `None` when nothing printable is left.
pub fn clean_label(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_label_trims() {
        assert_eq!(clean_label("  Tech  ").as_deref(), Some("Tech"));
    }

    #[test]
    fn test_clean_label_strips_escape_sequences() {
        assert_eq!(clean_label("News\x1b\x07").as_deref(), Some("News"));
    }

    #[test]
    fn test_clean_label_rejects_blank() {
        assert!(clean_label(" \t\n ").is_none());
        assert!(clean_label("").is_none());
    }
}
