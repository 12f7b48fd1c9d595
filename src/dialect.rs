//! Dialect capability boundary
//!
//! Everything engine-specific — identifier quoting, value quoting, identifier
//! grammar, operator remapping — lives behind the [`Dialect`] trait. The
//! compiler never quotes or escapes anything itself; this trait is the sole
//! injection-safety boundary.

use std::fmt;

use serde_json::Value;

use crate::compiler::condition::{Comparison, ConditionValue};
use crate::errors::{QueryError, QueryResult};
use crate::expression::SqlExpression;

/// Connection/engine capabilities the compiler calls into.
pub trait Dialect: fmt::Debug + Send + Sync {
    /// Quote a single identifier (table, column or alias name).
    fn quote_identifier(&self, name: &str) -> String;

    /// Quote a scalar value for direct inclusion in SQL text.
    ///
    /// `hint` carries the column's typecast when one was specified, letting
    /// the dialect coerce or reject values (e.g. a non-numeric string under a
    /// numeric cast). Rejections are relayed to the caller verbatim.
    fn quote_value(&self, value: &Value, hint: Option<&str>) -> QueryResult<String>;

    /// Render an opaque expression. Default: verbatim passthrough.
    fn quote_expression(&self, expr: &SqlExpression) -> String {
        expr.as_str().to_string()
    }

    /// Check a name against the engine's identifier grammar. With
    /// `allow_json_selector` the grammar also accepts selector chains such as
    /// `data->>'name'` (operators `->`, `->>`, `#>`, `#>>`).
    fn is_valid_identifier(&self, name: &str, allow_json_selector: bool) -> bool;

    fn supports_schema_qualified_names(&self) -> bool {
        true
    }

    /// Map a generic comparison to the engine's operator text. The value is
    /// provided so dialects can remap by shape (e.g. array containment).
    fn convert_operator(&self, operator: Comparison, _value: &ConditionValue) -> String {
        operator.to_sql().to_string()
    }
}

/// Reference dialect for PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

/// Typecast hints that require a numeric value.
const NUMERIC_CASTS: &[&str] = &[
    "smallint",
    "int",
    "integer",
    "bigint",
    "decimal",
    "numeric",
    "real",
    "float",
    "double precision",
];

impl Dialect for PostgresDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn quote_value(&self, value: &Value, hint: Option<&str>) -> QueryResult<String> {
        if let Some(cast) = hint
            && NUMERIC_CASTS.contains(&cast.to_ascii_lowercase().as_str())
            && !value_is_numeric(value)
        {
            return Err(QueryError::UnconvertibleValue(format!(
                "value {value} is not numeric (cast to {cast})"
            )));
        }

        match value {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(true) => Ok("TRUE".to_string()),
            Value::Bool(false) => Ok("FALSE".to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
            Value::Array(_) | Value::Object(_) => Err(QueryError::UnconvertibleValue(format!(
                "composite value {value} cannot be quoted as a scalar"
            ))),
        }
    }

    fn is_valid_identifier(&self, name: &str, allow_json_selector: bool) -> bool {
        if is_plain_identifier(name) {
            return true;
        }
        allow_json_selector && is_json_selector(name)
    }

    fn convert_operator(&self, operator: Comparison, _value: &ConditionValue) -> String {
        // PostgreSQL containment operators; everything else is standard SQL.
        match operator {
            Comparison::Overlaps => "&&".to_string(),
            Comparison::Contains => "@>".to_string(),
            Comparison::ContainedBy => "<@".to_string(),
            other => other.to_sql().to_string(),
        }
    }
}

fn value_is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) | Value::Null => true,
        Value::String(s) => s.parse::<f64>().is_ok(),
        Value::Array(items) => items.iter().all(value_is_numeric),
        _ => false,
    }
}

/// `^[A-Za-z_][A-Za-z0-9_]*$`
pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const JSON_OPERATORS: [&str; 4] = ["->>", "->", "#>>", "#>"];

/// Byte offset of the first JSON selector operator, if any.
pub(crate) fn find_json_operator(s: &str) -> Option<usize> {
    let arrow = s.find("->");
    let hash = s.find("#>");
    match (arrow, hash) {
        (Some(a), Some(h)) => Some(a.min(h)),
        (Some(a), None) => Some(a),
        (None, Some(h)) => Some(h),
        (None, None) => None,
    }
}

fn strip_json_operator(s: &str) -> Option<&str> {
    JSON_OPERATORS
        .iter()
        .find_map(|op| s.strip_prefix(op))
}

/// Selector grammar: `base (op key)+` where op is a JSON operator and key is
/// a single-quoted string, a bare identifier, or digits.
fn is_json_selector(s: &str) -> bool {
    let Some(idx) = find_json_operator(s) else {
        return false;
    };
    let (base, mut rest) = s.split_at(idx);
    if !is_plain_identifier(base) {
        return false;
    }
    while !rest.is_empty() {
        let Some(after) = strip_json_operator(rest) else {
            return false;
        };
        if let Some(quoted) = after.strip_prefix('\'') {
            match quoted.find('\'') {
                Some(0) | None => return false,
                Some(end) => rest = &quoted[end + 1..],
            }
        } else {
            let end = find_json_operator(after).unwrap_or(after.len());
            let key = &after[..end];
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return false;
            }
            rest = &after[end..];
        }
    }
    true
}
