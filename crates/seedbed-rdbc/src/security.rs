//! SQL text safety checks for seedbed-rdbc.
//!
//! Provides:
//! - String literal escaping for catalog lookups that cannot be parameterized
//! - Identifier validation for names read from dataset paths and headers
//! - Predicate validation for caller-supplied row filters
//!
//! Values are always bound as parameters; these helpers only guard the
//! fragments that have to be spliced into statement text.

use crate::error::Error;

/// Escape a string value for a SQL string literal context.
///
/// Replaces `'` with `''` (standard SQL escaping for single-quoted literals).
///
/// # Examples
///
/// ```
/// use seedbed_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("users"), "users");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate an identifier before it is quoted into SQL text.
///
/// Quoting already escapes delimiters; this rejects what quoting cannot make
/// sensible: empty names, control characters and overlong names.
///
/// ```
/// use seedbed_rdbc::security::validate_identifier;
///
/// assert!(validate_identifier("invoice_details").is_ok());
/// assert!(validate_identifier("Order Lines").is_ok());
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier("a\0b").is_err());
/// ```
pub fn validate_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains control character {:?}",
            name.escape_debug(),
            c
        )));
    }

    Ok(())
}

/// Validate a caller-supplied row predicate (e.g. `status = 'open'`) that is
/// ANDed into a generated SELECT.
///
/// Statement separators and comments are rejected so the predicate cannot
/// terminate or truncate the surrounding statement. Parentheses must balance.
///
/// ```
/// use seedbed_rdbc::security::validate_predicate;
///
/// assert!(validate_predicate("total > 100 AND status = 'open'").is_ok());
/// assert!(validate_predicate("1=1; DROP TABLE invoices").is_err());
/// assert!(validate_predicate("id = 1 -- trailing").is_err());
/// ```
pub fn validate_predicate(predicate: &str) -> crate::Result<()> {
    let trimmed = predicate.trim();
    if trimmed.is_empty() {
        return Err(Error::config("row predicate cannot be empty"));
    }

    let mut depth: i32 = 0;
    let mut in_literal = false;
    let mut prev = '\0';
    for c in trimmed.chars() {
        if in_literal {
            if c == '\'' {
                in_literal = false;
            }
            prev = c;
            continue;
        }
        match c {
            '\'' => in_literal = true,
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' => return Err(Error::config("row predicate must not contain ';'")),
            '-' if prev == '-' => {
                return Err(Error::config("row predicate must not contain comments"))
            }
            '*' if prev == '/' => {
                return Err(Error::config("row predicate must not contain comments"))
            }
            _ => {}
        }
        if depth < 0 {
            return Err(Error::config("row predicate has unbalanced parentheses"));
        }
        prev = c;
    }

    if in_literal {
        return Err(Error::config("row predicate has an unterminated literal"));
    }
    if depth != 0 {
        return Err(Error::config("row predicate has unbalanced parentheses"));
    }
    Ok(())
}
