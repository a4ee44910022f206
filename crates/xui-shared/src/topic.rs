//! World-room topic sanitizer.

use crate::constants::DEFAULT_WORLD_ROOM;

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '.' | '_')
}

/// Reduce a room name to `[a-z0-9._-]` with no repeated or dangling
/// separators. Never returns an empty string.
pub fn sanitize_topic(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || is_separator(c) {
            c
        } else {
            '-'
        };
        if is_separator(c) && out.chars().last().is_some_and(is_separator) {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(is_separator);
    if trimmed.is_empty() {
        DEFAULT_WORLD_ROOM.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_room() {
        assert_eq!(sanitize_topic("Family Room!"), "family-room");
    }

    #[test]
    fn test_collapses_runs() {
        assert_eq!(sanitize_topic("a  --  b"), "a-b");
        assert_eq!(sanitize_topic("x._y"), "x.y");
        assert_eq!(sanitize_topic("__lobby__"), "lobby");
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(sanitize_topic(""), DEFAULT_WORLD_ROOM);
        assert_eq!(sanitize_topic("!!!"), DEFAULT_WORLD_ROOM);
        assert_eq!(sanitize_topic("日本"), DEFAULT_WORLD_ROOM);
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "Family Room!",
            "",
            "  ",
            "Ünïcödé Lounge",
            "a.-_b",
            "-start-and-end-",
            "UPPER_lower.123",
            "tab\tand\nnewline",
            "xui-world",
        ];
        for s in samples {
            let once = sanitize_topic(s);
            assert_eq!(sanitize_topic(&once), once, "input {s:?}");
            assert!(!once.is_empty());
            assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || is_separator(c)));
        }
    }
}
