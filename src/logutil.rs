//! Helpers for putting untrusted mesh text into log lines.
//! Mesh users type newlines, tabs and emoji; logs must stay one line per event.

use std::fmt::Write;

/// Characters kept by [`preview`] before the ellipsis.
pub const PREVIEW_CHARS: usize = 50;

/// Escape a string for single-line logging and cap its length.
///
/// `\n`, `\r`, `\t` and backslash get their usual escapes, other control
/// characters become `\xNN`. Anything past `max_chars` characters is replaced
/// by a single `…`.
pub fn escape_bounded(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
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

/// Escape with a generous cap, for debug-level dumps.
pub fn escape_log(s: &str) -> String {
    escape_bounded(s, 300)
}

/// Short escaped preview used in info-level receive/send lines.
pub fn preview(s: &str) -> String {
    escape_bounded(s, PREVIEW_CHARS)
}
