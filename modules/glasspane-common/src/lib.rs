pub mod config;
pub mod error;
pub mod pii;
pub mod severity;
pub mod types;

pub use config::Config;
pub use error::GlasspaneError;
pub use pii::{classify_pii_risk, PiiRisk};
pub use severity::Severity;
pub use types::*;

/// Truncate a string to at most `max` characters, appending `"..."` when
/// anything was cut. Always splits on a char boundary.
///
/// ```
/// assert_eq!(glasspane_common::truncate_chars("hello", 10), "hello");
/// assert_eq!(glasspane_common::truncate_chars("hello world", 5), "hello...");
/// ```
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

/// Truncate a string to at most `max` characters with an explicit
/// `"... [truncated]"` marker, used for embedding inputs where the reader
/// should know content was dropped.
pub fn truncate_marked(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_char_boundary_safe() {
        let s = "héllo wörld";
        let t = truncate_chars(s, 4);
        assert_eq!(t, "héll...");
    }

    #[test]
    fn truncate_marked_keeps_short_strings() {
        assert_eq!(truncate_marked("short", 100), "short");
    }
}
