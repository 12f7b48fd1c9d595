//! Opaque raw-SQL expression wrapper

use std::fmt;

/// A raw SQL fragment that the compiler passes through without parsing.
///
/// Expressions bypass identifier validation and value quoting entirely, so
/// they must never carry untrusted input. The caller owns their correctness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlExpression(String);

impl SqlExpression {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SqlExpression {
    fn from(sql: &str) -> Self {
        Self(sql.to_string())
    }
}

impl From<String> for SqlExpression {
    fn from(sql: String) -> Self {
        Self(sql)
    }
}
