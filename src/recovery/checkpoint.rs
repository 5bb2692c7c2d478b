//! Rewriting the producer's resume checkpoint.
//!
//! The producer reads a `start_datetime = "..."` line from its TOML config
//! and resumes scanning from that instant after a restart.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Key holding the producer's resume timestamp.
pub const CHECKPOINT_KEY: &str = "start_datetime";

/// First line assigning the key, commented out or not.
static CHECKPOINT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#?[ \t]*start_datetime[ \t]*=[^\r\n]*")
        .expect("checkpoint pattern is valid")
});

/// Result of [`rewrite_checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub content: String,
    /// `true` if an existing line was replaced, `false` if one was appended.
    pub replaced: bool,
}

/// `2024-05-01T11:50:00.000+0000`: millisecond precision, explicit zero offset.
pub fn format_checkpoint(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string()
}

pub fn checkpoint_line(timestamp: &str) -> String {
    format!("{CHECKPOINT_KEY} = \"{timestamp}\"")
}

/// Point the first `start_datetime` line at `timestamp`, keeping its
/// indentation and uncommenting it. Appends a line if there is none.
pub fn rewrite_checkpoint(content: &str, timestamp: &str) -> Rewrite {
    let line = checkpoint_line(timestamp);

    if let Some(found) = CHECKPOINT_LINE.find(content) {
        let matched = found.as_str();
        let indent_len = matched.len() - matched.trim_start_matches([' ', '\t']).len();

        let mut out = String::with_capacity(content.len() + line.len());
        out.push_str(&content[..found.start()]);
        out.push_str(&matched[..indent_len]);
        out.push_str(&line);
        out.push_str(&content[found.end()..]);
        return Rewrite {
            content: out,
            replaced: true,
        };
    }

    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&line);
    out.push('\n');
    Rewrite {
        content: out,
        replaced: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TS: &str = "2024-05-01T11:50:00.000+0000";

    #[test]
    fn test_format_checkpoint() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 11, 50, 0).unwrap();
        assert_eq!(format_checkpoint(at), TS);

        let with_millis = at + chrono::Duration::milliseconds(7);
        assert_eq!(format_checkpoint(with_millis), "2024-05-01T11:50:00.007+0000");
    }

    #[test]
    fn test_replaces_existing_line_only() {
        let content = "[scanner]\nstart_datetime = \"2020-01-01T00:00:00.000+0000\"\nrpc = \"x\"\n";
        let rewrite = rewrite_checkpoint(content, TS);
        assert!(rewrite.replaced);
        assert_eq!(
            rewrite.content,
            format!("[scanner]\nstart_datetime = \"{TS}\"\nrpc = \"x\"\n")
        );
    }

    #[test]
    fn test_uncomments_and_keeps_indent() {
        let content = "[scanner]\n  # start_datetime = \"old\"\n";
        let rewrite = rewrite_checkpoint(content, TS);
        assert_eq!(
            rewrite.content,
            format!("[scanner]\n  start_datetime = \"{TS}\"\n")
        );
    }

    #[test]
    fn test_only_first_occurrence_changes() {
        let content = "start_datetime = \"a\"\nstart_datetime = \"b\"\n";
        let rewrite = rewrite_checkpoint(content, TS);
        assert_eq!(
            rewrite.content,
            format!("start_datetime = \"{TS}\"\nstart_datetime = \"b\"\n")
        );
    }

    #[test]
    fn test_similar_keys_are_not_touched() {
        let content = "start_datetime_override = 1\n";
        let rewrite = rewrite_checkpoint(content, TS);
        assert!(!rewrite.replaced);
        assert_eq!(
            rewrite.content,
            format!("start_datetime_override = 1\nstart_datetime = \"{TS}\"\n")
        );
    }

    #[test]
    fn test_appends_with_separating_newline() {
        let rewrite = rewrite_checkpoint("rpc = \"x\"", TS);
        assert!(!rewrite.replaced);
        assert_eq!(rewrite.content, format!("rpc = \"x\"\nstart_datetime = \"{TS}\"\n"));

        let empty = rewrite_checkpoint("", TS);
        assert_eq!(empty.content, format!("start_datetime = \"{TS}\"\n"));
    }

    #[test]
    fn test_crlf_line_endings_survive() {
        let content = "start_datetime = \"old\"\r\nrpc = 1\r\n";
        let rewrite = rewrite_checkpoint(content, TS);
        assert_eq!(
            rewrite.content,
            format!("start_datetime = \"{TS}\"\r\nrpc = 1\r\n")
        );
    }
}
