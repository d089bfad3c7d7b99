//! Small string helpers.

/// Truncate `s` to at most `max` characters, appending an ellipsis when
/// anything was cut. Used to bound the cardinality of abort-message
/// histograms.
pub fn abbreviate(s: &str, max: usize) -> String {
    let mut chars = s.char_indices();
    match chars.nth(max) {
        None => s.to_string(),
        Some((byte_idx, _)) => {
            let mut out = String::with_capacity(byte_idx + '…'.len_utf8());
            out.push_str(&s[..byte_idx]);
            out.push('…');
            out
        }
    }
}
