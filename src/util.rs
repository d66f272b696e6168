//! Small text helpers shared by logging and status notifications.

/// Truncate `s` to at most `max_chars` characters, appending "..." when cut.
///
/// Cuts on character boundaries, so multi-byte text (emoji, CJK) never panics.
///
/// ```
/// use chatrelay::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// One-line preview of a chat message for log lines.
pub fn preview(text: &str) -> String {
    let single_line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    truncate_with_ellipsis(single_line.trim(), 70)
}
