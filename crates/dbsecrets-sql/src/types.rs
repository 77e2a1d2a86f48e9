//! Value and row types exchanged with SQL backends
//!
//! Administrative statements only ever bind usernames and read back
//! booleans, counts and names, so the value model is deliberately small.

use std::fmt;

/// A bound parameter or a column value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer column
    Int(i64),
    /// Text of any flavour (`text`, `name`, `nvarchar`, ...)
    Text(String),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness as returned by an existence probe.
    ///
    /// Accepts `true`, a positive count, or the strings `"true"` / `"1"`
    /// that the Snowflake SQL API returns for every column.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(n) => Some(*n > 0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" => Some(true),
                "false" | "f" => Some(false),
                other => other.parse::<i64>().ok().map(|n| n > 0),
            },
            Value::Null => None,
        }
    }

    /// Integer view
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    /// Borrow as string slice if this is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A row returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Column values
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value by index
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value by column name, case-insensitively
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// First column as text, the common shape of catalog queries
    pub fn first_text(&self) -> Option<String> {
        match self.values.first()? {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}
