//! Utility functions for `clawbridge`.
//!
//! String truncation for diagnostics and the lenient JSON parsing shared by
//! the channel envelope decoder and the reply matcher.

use serde::de::DeserializeOwned;

/// Maximum number of characters of raw backend output quoted in errors.
pub const PREVIEW_MAX_CHARS: usize = 240;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// This function safely handles multi-byte UTF-8 characters (emoji, CJK, accented characters)
/// by using character boundaries instead of byte indices.
///
/// # Examples
/// ```ignore
/// use clawbridge::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Bounded preview of raw backend output for error messages.
pub fn output_preview(raw: &str) -> String {
    let raw = raw.trim();
    match raw.char_indices().nth(PREVIEW_MAX_CHARS) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}

/// Slice from the first `{` to the last `}` (inclusive), if both exist in order.
pub fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse `text` as JSON, falling back to the outermost brace span when the
/// text carries leading or trailing chatter.
pub fn parse_json_lenient<T: DeserializeOwned>(text: &str) -> Option<T> {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    brace_span(text).and_then(|span| serde_json::from_str(span).ok())
}
