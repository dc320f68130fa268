//! Function-local `.env` parsing.
//!
//! Each function directory may carry a `.env` whose pairs are exposed to
//! that function's handlers only; nothing ever reaches the host process
//! environment. Invalid lines are skipped with a WARN on the function's
//! log.

use std::collections::HashMap;
use std::path::Path;

use serde_json::json;

use crate::logger::Logger;

/// Parse `<dir>/.env` into an environment map. A missing file yields an
/// empty map.
pub fn load_env(dir: &Path, logger: &Logger) -> std::io::Result<HashMap<String, String>> {
    let path = dir.join(".env");
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err),
    };
    Ok(parse(&contents, logger))
}

fn parse(contents: &str, logger: &Logger) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            logger.warn(
                "ignoring invalid .env line",
                json!({"line": lineno + 1, "content": raw}),
            );
            continue;
        };

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            logger.warn(
                "ignoring invalid .env key",
                json!({"line": lineno + 1, "key": key}),
            );
            continue;
        }

        env.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    env
}

/// Strip one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogLevel, LoggerConfig};
    use tempfile::TempDir;

    fn logger(dir: &TempDir) -> Logger {
        Logger::new(LoggerConfig::new(dir.path().join("logs"))).expect("logger")
    }

    #[tokio::test]
    async fn parses_pairs_comments_and_quotes() {
        let dir = TempDir::new().unwrap();
        let contents = "\
# comment
API_KEY=secret
GREETING=\"hello world\"
NAME='single'
EMPTY=
SPACED = padded
";
        let env = parse(contents, &logger(&dir));
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("secret"));
        assert_eq!(env.get("GREETING").map(String::as_str), Some("hello world"));
        assert_eq!(env.get("NAME").map(String::as_str), Some("single"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(env.get("SPACED").map(String::as_str), Some("padded"));
        assert_eq!(env.len(), 5);
    }

    #[tokio::test]
    async fn invalid_lines_are_skipped_with_a_warn() {
        let dir = TempDir::new().unwrap();
        let logger = logger(&dir);
        let env = parse("no_equals_here\nOK=1\n2BAD KEY=x\n", &logger);
        assert_eq!(env.len(), 1);
        assert!(env.contains_key("OK"));

        let warns = logger.recent(10, None, Some(LogLevel::Warn));
        assert_eq!(warns.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_map() {
        let dir = TempDir::new().unwrap();
        let env = load_env(dir.path(), &logger(&dir)).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn unquote_requires_matching_quotes() {
        assert_eq!(unquote("\"a\""), "a");
        assert_eq!(unquote("'a'"), "a");
        assert_eq!(unquote("\"a'"), "\"a'");
        assert_eq!(unquote("\""), "\"");
    }
}
