//! Identifier quoting and literal escaping for synthesized statements.
//!
//! Revocation sweeps interpolate schema and user names into statements that
//! cannot be parameterized (`REVOKE ... FROM <ident>`). These helpers make
//! those interpolations safe.

/// Double-quote a SQL identifier.
///
/// The input is truncated at the first NUL byte and every embedded `"` is
/// doubled.
///
/// # Examples
///
/// ```
/// use dbsecrets_plugin::security::quote_identifier;
///
/// assert_eq!(quote_identifier("public"), "\"public\"");
/// assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
/// assert_eq!(quote_identifier("cut\0here"), "\"cut\"");
/// ```
pub fn quote_identifier(name: &str) -> String {
    let name = match name.find('\0') {
        Some(end) => &name[..end],
        None => name,
    };
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Reverse [`quote_identifier`] for an identifier without NUL bytes.
///
/// Returns `None` when the input is not a well-formed quoted identifier.
pub fn unquote_identifier(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            // Embedded quotes must come in pairs.
            if chars.next() != Some('"') {
                return None;
            }
        }
        out.push(c);
    }
    Some(out)
}

/// Bracket-quote a SQL Server identifier, doubling embedded `]`.
///
/// ```
/// use dbsecrets_plugin::security::quote_bracket_identifier;
///
/// assert_eq!(quote_bracket_identifier("v-user"), "[v-user]");
/// assert_eq!(quote_bracket_identifier("a]b"), "[a]]b]");
/// ```
pub fn quote_bracket_identifier(name: &str) -> String {
    let name = match name.find('\0') {
        Some(end) => &name[..end],
        None => name,
    };
    format!("[{}]", name.replace(']', "]]"))
}

/// Escape a string value for interpolation into a SQL string literal.
///
/// Replaces `'` with `''`.
///
/// ```
/// use dbsecrets_plugin::security::escape_string_literal;
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ==================== quote_identifier ====================

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote_identifier("testu"), "\"testu\"");
        assert_eq!(quote_identifier(""), "\"\"");
    }

    #[test]
    fn test_quote_doubles_embedded_quotes() {
        assert_eq!(quote_identifier("a\"b\"c"), "\"a\"\"b\"\"c\"");
    }

    #[test]
    fn test_quote_truncates_at_nul() {
        assert_eq!(quote_identifier("abc\0def\"ghi"), "\"abc\"");
        assert_eq!(quote_identifier("\0"), "\"\"");
    }

    #[test]
    fn test_unquote_rejects_malformed() {
        assert_eq!(unquote_identifier("abc"), None);
        assert_eq!(unquote_identifier("\"a\"b\""), None);
        assert_eq!(unquote_identifier("\"a\"\"b\""), Some("a\"b".to_string()));
    }

    // ==================== injection ====================

    #[test]
    fn test_quote_neutralizes_injection() {
        let quoted = quote_identifier("x\" FROM y; DROP TABLE users; --");
        assert_eq!(quoted, "\"x\"\" FROM y; DROP TABLE users; --\"");
        assert_eq!(
            unquote_identifier(&quoted).as_deref(),
            Some("x\" FROM y; DROP TABLE users; --")
        );
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal("x'; DROP TABLE users--"), "x''; DROP TABLE users--");
    }

    proptest! {
        #[test]
        fn prop_quote_round_trip(name in "[^\\x00]*") {
            let quoted = quote_identifier(&name);
            prop_assert_eq!(unquote_identifier(&quoted), Some(name));
        }

        #[test]
        fn prop_bracket_quote_is_balanced(name in "[^\\x00]*") {
            let quoted = quote_bracket_identifier(&name);
            prop_assert!(quoted.starts_with('['));
            prop_assert!(quoted.ends_with(']'));
            prop_assert_eq!(quoted[1..quoted.len() - 1].replace("]]", "]"), name);
        }
    }
}
