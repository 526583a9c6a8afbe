//! Common utility functions used across the codebase.

/// Truncates a string to at most `max_chars` characters, adding "..." if truncated.
///
/// UTF-8 safe: counts characters, not bytes, so multi-byte content never
/// panics at a boundary.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    truncate_impl(s, max_chars, "...")
}

/// Truncates a string to at most `max_chars` characters, adding
/// "\n... (truncated)" if truncated. Suited to multi-line tool output where
/// the cut must be visible on its own line.
pub fn truncate_with_note(s: &str, max_chars: usize) -> String {
    truncate_impl(s, max_chars, "\n... (truncated)")
}

fn truncate_impl(s: &str, max_chars: usize, suffix: &str) -> String {
    // Byte length <= max_chars implies char count <= max_chars.
    if s.len() <= max_chars {
        return s.to_string();
    }

    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }

    let suffix_len = suffix.chars().count();
    if max_chars <= suffix_len {
        return suffix.chars().take(max_chars).collect();
    }

    let keep = max_chars - suffix_len;
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(suffix);
    out
}

/// Rough token estimate for budget accounting: one token per four characters,
/// with a floor of one token per word. Intentionally provider-agnostic; the
/// context manager only needs a consistent over-approximation.
pub fn estimate_tokens(s: &str) -> usize {
    if s.is_empty() {
        return 0;
    }
    let by_chars = s.chars().count().div_ceil(4);
    let by_words = s.split_whitespace().count();
    by_chars.max(by_words)
}

/// Extract the first balanced JSON object embedded in free text and parse it.
///
/// Models wrap structured replies in prose or code fences more often than
/// not; this scans for the first `{`, tracks brace depth while respecting
/// string literals and escapes, and parses the balanced slice.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_adds_ellipsis() {
        assert_eq!(truncate_str("hello world", 8), "hello...");
    }

    #[test]
    fn test_truncate_multibyte_safe() {
        let s = "日本語のテキストです";
        let out = truncate_str(s, 6);
        assert_eq!(out.chars().count(), 6);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_truncate_with_note_suffix() {
        let out = truncate_with_note(&"x".repeat(100), 30);
        assert!(out.ends_with("... (truncated)"));
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_scales_with_length() {
        let short = estimate_tokens("one two three");
        let long = estimate_tokens(&"word ".repeat(100));
        assert!(long > short);
        assert!(short >= 3);
    }

    #[test]
    fn test_extract_json_from_prose() {
        let text = "Sure, here is the plan:\n```json\n{\"title\": \"x\", \"steps\": []}\n```";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["title"], "x");
    }

    #[test]
    fn test_extract_json_nested_and_strings_with_braces() {
        let text = r#"prefix {"a": {"b": "contains } brace"}, "c": 1} suffix"#;
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["c"], 1);
        assert_eq!(v["a"]["b"], "contains } brace");
    }

    #[test]
    fn test_extract_json_none_when_unbalanced() {
        assert!(extract_json_object("{\"a\": ").is_none());
        assert!(extract_json_object("no json here").is_none());
    }
}
