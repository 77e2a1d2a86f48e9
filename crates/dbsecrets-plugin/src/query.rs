//! Statement templating and splitting
//!
//! Operator statements reference request values as `{{name}}`, `{{username}}`,
//! `{{password}}` and `{{expiration}}`. [`query_template`] performs a single
//! left-to-right pass: replacement values are emitted verbatim and never
//! rescanned, and unknown placeholders are left intact.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Placeholder values for one statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: BTreeMap<String, String>,
}

impl QueryParams {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a placeholder value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set a placeholder value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a placeholder value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over `(key, value)` pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of placeholders
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no placeholders are set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Substitute `{{key}}` placeholders in one pass without recursion.
///
/// ```rust
/// use dbsecrets_plugin::query::{query_template, QueryParams};
///
/// let params = QueryParams::new().with("name", "alice");
/// assert_eq!(
///     query_template("DROP ROLE \"{{name}}\" -- {{other}}", &params),
///     "DROP ROLE \"alice\" -- {{other}}"
/// );
/// ```
pub fn query_template(template: &str, params: &QueryParams) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start + 2..];

        let replaced = candidate.find("}}").and_then(|end| {
            params
                .get(&candidate[..end])
                .map(|value| (value, start + 2 + end + 2))
        });

        match replaced {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &rest[consumed..];
            }
            None => {
                // Not a known placeholder: emit one brace and rescan from the next one.
                out.push('{');
                rest = &rest[start + 1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Split a statement on `;`, trimming whitespace and dropping empty parts
pub fn split_statements(statement: &str) -> Vec<&str> {
    statement
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

static END_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bEND\b").expect("valid END regex"));

/// Whether a statement looks like a procedural block that must not be split.
///
/// Quoted literals are stripped first (cumulatively), then the statement is
/// searched for the word `END`. False negatives fall back to splitting.
pub fn contains_multiline_statement(statement: &str) -> bool {
    let mut stripped = statement.to_string();
    for literal in extract_quoted_strings(statement) {
        stripped = stripped.replacen(&literal, "", 1);
    }
    END_KEYWORD.is_match(&stripped)
}

/// Split a statement unless it holds a `BEGIN ... END` style block
pub fn split_unless_multiline(statement: &str) -> Vec<&str> {
    if contains_multiline_statement(statement) {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed]
        }
    } else {
        split_statements(statement)
    }
}

/// Extract quoted substrings, double-quoted ones first, then single-quoted.
///
/// Quotes are included in the results. An unterminated quote contributes
/// nothing for its kind.
pub fn extract_quoted_strings(statement: &str) -> Vec<String> {
    let mut found = extract_delimited(statement, '"');
    found.extend(extract_delimited(statement, '\''));
    found
}

fn extract_delimited(statement: &str, quote: char) -> Vec<String> {
    let mut found = Vec::new();
    let mut open: Option<usize> = None;

    for (idx, ch) in statement.char_indices() {
        if ch != quote {
            continue;
        }
        match open.take() {
            Some(start) => found.push(statement[start..idx + ch.len_utf8()].to_string()),
            None => open = Some(idx),
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== query_template ====================

    #[test]
    fn test_basic_substitution() {
        let params = QueryParams::new()
            .with("name", "v-token-abc")
            .with("password", "pw")
            .with("expiration", "2030-01-01 00:00:00+0000");
        let out = query_template(
            "CREATE ROLE \"{{name}}\" WITH LOGIN PASSWORD '{{password}}' VALID UNTIL '{{expiration}}';",
            &params,
        );
        assert_eq!(
            out,
            "CREATE ROLE \"v-token-abc\" WITH LOGIN PASSWORD 'pw' VALID UNTIL '2030-01-01 00:00:00+0000';"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_intact() {
        let params = QueryParams::new().with("name", "x");
        assert_eq!(query_template("{{foo}} {{name}}", &params), "{{foo}} x");
        assert_eq!(query_template("{{name", &params), "{{name");
        assert_eq!(query_template("{{{name}}}", &params), "{x}");
    }

    #[test]
    fn test_non_recursive_substitution() {
        let params = QueryParams::new()
            .with("a", "A{{a}}{{b}}{{c}}{{d}}")
            .with("b", "B{{a}}{{b}}{{c}}{{d}}")
            .with("c", "C{{a}}{{b}}{{c}}{{d}}")
            .with("d", "D{{a}}{{b}}{{c}}{{d}}");

        let out = query_template("{{a}}{{b}}{{c}}{{d}}", &params);
        assert_eq!(
            out,
            "A{{a}}{{b}}{{c}}{{d}}B{{a}}{{b}}{{c}}{{d}}C{{a}}{{b}}{{c}}{{d}}D{{a}}{{b}}{{c}}{{d}}"
        );
        assert_eq!(out.len(), 84);
    }

    #[test]
    fn test_empty_template() {
        assert_eq!(query_template("", &QueryParams::new()), "");
    }

    // ==================== splitting ====================

    #[test]
    fn test_split_statements() {
        let parts = split_statements(" CREATE ROLE a; ;GRANT x TO a;\n");
        assert_eq!(parts, vec!["CREATE ROLE a", "GRANT x TO a"]);
    }

    #[test]
    fn test_contains_multiline_statement() {
        let block = r#"DO $$ BEGIN IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname='my_role') THEN CREATE ROLE my_role; END IF; END $$"#;
        assert!(contains_multiline_statement(block));

        let templated = r#"DO $$ BEGIN IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname="{{name}}") THEN CREATE ROLE {{name}}; END IF; END $$"#;
        assert!(contains_multiline_statement(templated));

        let docs = "CREATE ROLE \"{{name}}\" WITH LOGIN PASSWORD '{{password}}' VALID UNTIL '{{expiration}}'; \\\n        GRANT SELECT ON ALL TABLES IN SCHEMA public TO \"{{name}}\";";
        assert!(!contains_multiline_statement(docs));
    }

    #[test]
    fn test_quoted_end_is_ignored() {
        assert!(!contains_multiline_statement("COMMENT ON ROLE x IS 'THE END'"));
    }

    #[test]
    fn test_split_unless_multiline() {
        let block = "DO $$ BEGIN CREATE ROLE a; END $$;";
        assert_eq!(split_unless_multiline(block), vec![block]);
        assert_eq!(split_unless_multiline("A; B"), vec!["A", "B"]);
    }

    // ==================== quoted strings ====================

    #[test]
    fn test_extract_quoted_strings() {
        assert!(extract_quoted_strings("Five little monkeys jumping on the bed").is_empty());
        assert!(extract_quoted_strings("").is_empty());
        assert!(extract_quoted_strings("Five little monkeys 'jumping on the bed").is_empty());

        assert_eq!(
            extract_quoted_strings(r#""Five" little 'monkeys' "jumping on" the' 'bed"#),
            vec![r#""Five""#, r#""jumping on""#, "'monkeys'", "' '"]
        );

        let templated = r#"DO $$ BEGIN IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname="{{name}}") THEN CREATE ROLE {{name}}; END IF; END $$"#;
        assert_eq!(extract_quoted_strings(templated), vec![r#""{{name}}""#]);
    }
}
