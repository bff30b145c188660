//! HTML sanitization for model-generated answers.
//!
//! The model is instructed to answer in semantic HTML, but its output is
//! untrusted. [`sanitize`] enforces a fixed allow-list (no attributes, no URL
//! schemes) over the accumulated answer before it is persisted or broadcast.
//! [`strip_tags`] produces the plain-text rendering used for live token
//! events and the `content` column.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Tags an assistant answer may contain. Everything else is stripped,
/// keeping inner text.
const ALLOWED_TAGS: [&str; 10] = [
    "p",
    "br",
    "ul",
    "ol",
    "li",
    "strong",
    "em",
    "code",
    "h4",
    "blockquote",
];

/// Sanitize model-produced HTML against the fixed allow-list.
///
/// No attributes survive (blocks `onclick` and friends) and no URL schemes
/// are permitted. Idempotent: sanitizing sanitized output is the identity.
pub fn sanitize(html: &str) -> String {
    ammonia::Builder::default()
        .tags(HashSet::from(ALLOWED_TAGS))
        .generic_attributes(HashSet::new())
        .url_schemes(HashSet::new())
        .link_rel(None)
        .clean(html)
        .to_string()
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("<[^>]*>").expect("valid regex"))
}

/// Remove markup from a text fragment: tag runs first, then any stray angle
/// brackets left by tags split across token boundaries.
pub fn strip_tags(text: &str) -> String {
    let without_tags = tag_pattern().replace_all(text, "");
    without_tags.replace(['<', '>'], "")
}

/// Derive the plain-text form of a sanitized answer.
pub fn plain_text(html: &str) -> String {
    strip_tags(html).trim().to_string()
}
