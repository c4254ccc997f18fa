//! Small text utilities shared across the pipeline.

/// Truncates a string to at most `max_chars` characters, respecting char
/// boundaries. `String::truncate` panics on non-boundary byte indices, so
/// every truncation of model- or repo-sourced text goes through here.
pub fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
    }
}

/// Returns the first `max_chars` characters of a string slice.
#[must_use]
pub fn prefix_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        let mut s = "hello world".to_string();
        truncate_chars(&mut s, 5);
        assert_eq!(s, "hello");
    }

    #[test]
    fn test_truncate_shorter_than_limit() {
        let mut s = "hi".to_string();
        truncate_chars(&mut s, 10);
        assert_eq!(s, "hi");
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        let mut s = "héllo wörld".to_string();
        truncate_chars(&mut s, 3);
        assert_eq!(s, "hél");
    }

    #[test]
    fn test_prefix_chars() {
        assert_eq!(prefix_chars("日本語テスト", 2), "日本");
        assert_eq!(prefix_chars("ab", 5), "ab");
    }
}
