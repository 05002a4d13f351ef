//! SQL script scanning.
//!
//! Splits a script into statements while respecting string literals, quoted
//! identifiers, comments and trigger bodies. Migration SQL is scanned when it
//! is loaded so malformed scripts are rejected up front; execution always
//! hands the whole script to SQLite.

use thiserror::Error;

/// Errors found while scanning a script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// A quote or block comment was opened and never closed.
    #[error("unterminated {kind} starting at byte {offset}")]
    Unterminated {
        /// What was left open.
        kind: &'static str,
        /// Byte offset of the opening delimiter.
        offset: usize,
    },

    /// The script holds nothing but whitespace and comments.
    #[error("script contains no statements")]
    Empty,
}

/// Split `sql` into its statements.
///
/// Returned statements are trimmed and carry no trailing `;`. Empty
/// statements (`;;`, comment-only fragments) are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<String>, ScanError> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;
    let mut words: Vec<String> = Vec::new();
    let mut trigger_depth = 0usize;
    let mut case_depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' | b'`' => {
                let kind = match b {
                    b'\'' => "string literal",
                    _ => "quoted identifier",
                };
                i = skip_quoted(bytes, i, b).ok_or(ScanError::Unterminated { kind, offset: i })?;
                has_content = true;
                continue;
            }
            b'[' => {
                let end = bytes[i..]
                    .iter()
                    .position(|&c| c == b']')
                    .ok_or(ScanError::Unterminated {
                        kind: "bracketed identifier",
                        offset: i,
                    })?;
                i += end + 1;
                has_content = true;
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..].find("*/").ok_or(ScanError::Unterminated {
                    kind: "block comment",
                    offset: i,
                })?;
                i += end + 4;
                continue;
            }
            b';' if trigger_depth == 0 => {
                if has_content {
                    push_statement(&mut statements, &sql[start..i]);
                }
                start = i + 1;
                has_content = false;
                words.clear();
                i += 1;
                continue;
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                let word_start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = sql[word_start..i].to_ascii_uppercase();
                has_content = true;
                if is_trigger(&words) {
                    match word.as_str() {
                        "BEGIN" => trigger_depth += 1,
                        "CASE" if trigger_depth > 0 => case_depth += 1,
                        "END" if case_depth > 0 => case_depth -= 1,
                        "END" if trigger_depth > 0 => trigger_depth -= 1,
                        _ => {}
                    }
                }
                if words.len() < 3 {
                    words.push(word);
                }
                continue;
            }
            _ => {
                if !b.is_ascii_whitespace() {
                    has_content = true;
                }
            }
        }
        i += 1;
    }

    if has_content {
        push_statement(&mut statements, &sql[start..]);
    }

    if statements.is_empty() {
        return Err(ScanError::Empty);
    }
    Ok(statements)
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Returns the index just past the closing quote, honoring doubled quotes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn is_trigger(words: &[String]) -> bool {
    match words {
        [create, trigger, ..] if create == "CREATE" && trigger == "TRIGGER" => true,
        [create, temp, trigger] if create == "CREATE" && trigger == "TRIGGER" => {
            temp == "TEMP" || temp == "TEMPORARY"
        }
        _ => false,
    }
}
