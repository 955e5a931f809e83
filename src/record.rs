//! Namespacing and the `"key":"value";` record line codec.

/// Namespace separator joining a namespace prefix to a name to form the
/// on-disk key.
pub const NAMESPACE_SEPARATOR: char = '~';

/// The two record namespaces a shard file can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// User key/value records.
    KeyVal,
    /// 8-gram posting list records.
    Trigram,
}

impl Namespace {
    /// The literal prefix used on disk for this namespace.
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::KeyVal => "KEYVAL",
            Namespace::Trigram => "TRIGRM",
        }
    }
}

/// Builds the on-disk key for a value record: `KEYVAL~<user key>`.
pub fn keyval_key(user_key: &str) -> String {
    format!("{}{}{}", Namespace::KeyVal.prefix(), NAMESPACE_SEPARATOR, user_key)
}

/// Builds the on-disk key for a posting-list record: `TRIGRM~<gram>`.
pub fn trigram_key(gram: &str) -> String {
    format!("{}{}{}", Namespace::Trigram.prefix(), NAMESPACE_SEPARATOR, gram)
}

/// Strips the `KEYVAL~` namespace prefix from an on-disk key, returning the
/// user key. `None` if `ondisk_key` is not a value-record key.
pub fn strip_keyval_prefix(ondisk_key: &str) -> Option<&str> {
    ondisk_key
        .strip_prefix(Namespace::KeyVal.prefix())
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
}

/// Strips the `TRIGRM~` namespace prefix from an on-disk key, returning the
/// gram. `None` if `ondisk_key` is not a posting-list key.
pub fn strip_trigram_prefix(ondisk_key: &str) -> Option<&str> {
    ondisk_key
        .strip_prefix(Namespace::Trigram.prefix())
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
}

/// Parses one data line of the shape `"<key>":"<value>";` into `(key,
/// value)`. Returns `None` if the line does not match the shape; callers
/// must skip such lines rather than error (the checksum is the integrity
/// gate, not per-line parsing).
pub fn parse_line(line: &str) -> Option<(String, String)> {
    let body = line.strip_suffix(';')?;
    let (left, right) = split_once_quoted(body)?;
    Some((left, right))
}

/// Splits `"a":"b"` into `(a, b)`, stripping the surrounding quotes from
/// each half. The split point is the first `":"` sequence, matching the
/// codec's "split at the first `;`, then split the left side at `":"`"
/// description.
fn split_once_quoted(body: &str) -> Option<(String, String)> {
    let sep = "\":\"";
    let idx = body.find(sep)?;
    let left = &body[..idx];
    let right = &body[idx + sep.len()..];

    let left = left.strip_prefix('"')?;
    let right = right.strip_suffix('"')?;

    Some((left.to_string(), right.to_string()))
}

/// Formats a `(key, value)` pair as one data line: `"<key>":"<value>";`.
pub fn format_line(key: &str, value: &str) -> String {
    format!("\"{}\":\"{}\";", key, value)
}

/// Returns true if a raw shard line should be skipped on read: blank, or a
/// `//` comment.
pub fn is_ignored_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_pair() {
        let line = format_line("alpha", "1");
        assert_eq!(line, "\"alpha\":\"1\";");
        assert_eq!(
            parse_line(&line),
            Some(("alpha".to_string(), "1".to_string()))
        );
    }

    #[test]
    fn keyval_and_trigram_prefixes() {
        assert_eq!(keyval_key("foo"), "KEYVAL~foo");
        assert_eq!(trigram_key("abcdefgh"), "TRIGRM~abcdefgh");
    }

    #[test]
    fn strip_keyval_prefix_round_trips() {
        let ondisk = keyval_key("foo");
        assert_eq!(strip_keyval_prefix(&ondisk), Some("foo"));
        assert_eq!(strip_keyval_prefix("TRIGRM~abcdefgh"), None);
    }

    #[test]
    fn strip_trigram_prefix_round_trips() {
        let ondisk = trigram_key("abcdefgh");
        assert_eq!(strip_trigram_prefix(&ondisk), Some("abcdefgh"));
        assert_eq!(strip_trigram_prefix("KEYVAL~foo"), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert_eq!(parse_line("not a record"), None);
        assert_eq!(parse_line("\"missing semicolon\":\"x\""), None);
        assert_eq!(parse_line("\"unterminated:\"x\";"), None);
    }

    #[test]
    fn ignored_lines() {
        assert!(is_ignored_line(""));
        assert!(is_ignored_line("   "));
        assert!(is_ignored_line("// a comment"));
        assert!(!is_ignored_line("\"a\":\"b\";"));
    }
}
