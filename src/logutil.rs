//! Logging helpers that keep mesh text and binary payloads on a single, bounded log line.
//!
//! Mesh traffic is foreign input: text may contain newlines or control characters and
//! payloads may be arbitrarily large. Everything that ends up in a log record goes
//! through one of these helpers first.

use std::fmt::Write;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Strings longer than 300 characters are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex preview of the first `max` bytes of a payload.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2 + 1);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push('…');
    }
    out
}

/// UTF-8 safe truncation for log display. Never cuts inside a multi-byte character;
/// truncated output ends with `...`.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_control_chars() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd"), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log("bell\u{7}"), "bell\\x07");
    }

    #[test]
    fn hex_snippet_marks_truncation() {
        assert_eq!(hex_snippet(&[0xde, 0xad, 0xbe, 0xef], 8), "deadbeef");
        assert_eq!(hex_snippet(&[0xde, 0xad, 0xbe, 0xef], 2), "dead…");
    }

    #[test]
    fn truncate_does_not_split_multibyte_chars() {
        // "—" is 3 bytes; a cut at 7 would land inside it.
        assert_eq!(truncate_for_log("12345—7890", 10), "12345...");
        // "🙂" is 4 bytes and starts exactly at the cut.
        assert_eq!(truncate_for_log("ab🙂cd", 5), "ab...");
        assert_eq!(truncate_for_log("hello", 10), "hello");
    }
}
