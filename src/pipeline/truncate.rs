//! Content truncator: bounds a body for the classifier without splitting words.

/// Returned for empty input so the classifier always has something to read.
pub const PLACEHOLDER: &str = "Email content could not be retrieved.";

/// Appended after a cut.
pub const TRUNCATION_MARKER: &str = " [...]";

/// Bound `text` to `max_len` characters plus [`TRUNCATION_MARKER`].
///
/// The cut is made at the last whitespace at or before `max_len`; with no
/// whitespace at all it falls exactly on `max_len`. Lengths are in chars.
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.is_empty() {
        return PLACEHOLDER.to_string();
    }

    let Some((cut_byte, next)) = text.char_indices().nth(max_len) else {
        return text.to_string();
    };

    let head = &text[..cut_byte];
    let kept = if next.is_whitespace() {
        head
    } else {
        match head.rfind(char::is_whitespace) {
            Some(pos) => &head[..pos],
            None => head,
        }
    };

    format!("{kept}{TRUNCATION_MARKER}")
}
