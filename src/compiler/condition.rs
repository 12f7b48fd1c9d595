//! Condition tree assembly
//!
//! Renders nested predicate trees (AND/OR groups, operator suffixes inferred
//! from condition keys, value-shape coercion) into SQL boolean expressions.
//! Value quoting is always delegated to the dialect.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::compiler::alias::AliasRegistry;
use crate::compiler::builder::QueryCompiler;
use crate::compiler::column::{self, ColumnCache, ColumnSpec, ParseContext};
use crate::dialect::Dialect;
use crate::errors::{QueryError, QueryResult};
use crate::expression::SqlExpression;

/// Glue word joining sibling conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glue {
    And,
    Or,
}

impl Glue {
    pub fn to_sql(&self) -> &'static str {
        match self {
            Glue::And => "AND",
            Glue::Or => "OR",
        }
    }

    fn parse(token: &str) -> Option<Glue> {
        match token.trim().to_ascii_lowercase().as_str() {
            "and" => Some(Glue::And),
            "or" => Some(Glue::Or),
            _ => None,
        }
    }
}

/// Comparison operators recognized in condition keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    NotLike,
    ILike,
    In,
    NotIn,
    Between,
    NotBetween,
    Is,
    IsNot,
    Overlaps,
    Contains,
    ContainedBy,
}

impl Comparison {
    pub fn to_sql(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
            Comparison::Like => "LIKE",
            Comparison::NotLike => "NOT LIKE",
            Comparison::ILike => "ILIKE",
            Comparison::In => "IN",
            Comparison::NotIn => "NOT IN",
            Comparison::Between => "BETWEEN",
            Comparison::NotBetween => "NOT BETWEEN",
            Comparison::Is => "IS",
            Comparison::IsNot => "IS NOT",
            Comparison::Overlaps => "&&",
            Comparison::Contains => "@>",
            Comparison::ContainedBy => "<@",
        }
    }

    fn parse(token: &str) -> Option<Comparison> {
        match token.to_ascii_lowercase().as_str() {
            "=" => Some(Comparison::Eq),
            "!=" | "<>" => Some(Comparison::Ne),
            ">" => Some(Comparison::Gt),
            "<" => Some(Comparison::Lt),
            ">=" => Some(Comparison::Gte),
            "<=" => Some(Comparison::Lte),
            "like" => Some(Comparison::Like),
            "not like" => Some(Comparison::NotLike),
            "ilike" => Some(Comparison::ILike),
            "in" => Some(Comparison::In),
            "not in" => Some(Comparison::NotIn),
            "between" => Some(Comparison::Between),
            "not between" => Some(Comparison::NotBetween),
            "is" => Some(Comparison::Is),
            "is not" | "not" => Some(Comparison::IsNot),
            "&&" => Some(Comparison::Overlaps),
            "@>" => Some(Comparison::Contains),
            "<@" => Some(Comparison::ContainedBy),
            _ => None,
        }
    }
}

/// Value side of one predicate.
#[derive(Debug, Clone)]
pub enum ConditionValue {
    /// Scalar or array literal; quoting is delegated to the dialect
    Scalar(Value),
    /// Raw SQL compared against verbatim
    Expression(SqlExpression),
    /// Nested tree; only meaningful under an `AND`/`OR` key
    Nested(ConditionTree),
    /// Compiled as a parenthesized sub-select
    SubQuery(Box<QueryCompiler>),
}

impl From<Value> for ConditionValue {
    fn from(value: Value) -> Self {
        ConditionValue::Scalar(value)
    }
}

impl From<SqlExpression> for ConditionValue {
    fn from(expr: SqlExpression) -> Self {
        ConditionValue::Expression(expr)
    }
}

impl From<ConditionTree> for ConditionValue {
    fn from(tree: ConditionTree) -> Self {
        ConditionValue::Nested(tree)
    }
}

impl From<QueryCompiler> for ConditionValue {
    fn from(query: QueryCompiler) -> Self {
        ConditionValue::SubQuery(Box::new(query))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ConditionEntry {
    /// Pre-assembled fragment, concatenated verbatim
    Raw(SqlExpression),
    Group(Glue, ConditionTree),
    Predicate(String, ConditionValue),
}

/// Ordered, recursive predicate tree.
#[derive(Debug, Clone, Default)]
pub struct ConditionTree {
    entries: Vec<ConditionEntry>,
}

impl ConditionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add one predicate. The key is a column spec with an optional operator
    /// suffix (`"age >="`, `"status !="`); the literal keys `AND`/`OR` paired
    /// with a nested tree open a grouped sub-tree instead.
    pub fn push(mut self, key: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(glue) = Glue::parse(&key)
            && let ConditionValue::Nested(tree) = value
        {
            self.entries.push(ConditionEntry::Group(glue, tree));
            return self;
        }
        self.entries.push(ConditionEntry::Predicate(key, value));
        self
    }

    /// Add a pre-assembled SQL fragment, emitted verbatim.
    pub fn raw(mut self, sql: impl Into<SqlExpression>) -> Self {
        self.entries.push(ConditionEntry::Raw(sql.into()));
        self
    }

    /// Add a parenthesized AND group.
    pub fn and_group(mut self, tree: ConditionTree) -> Self {
        self.entries.push(ConditionEntry::Group(Glue::And, tree));
        self
    }

    /// Add a parenthesized OR group.
    pub fn or_group(mut self, tree: ConditionTree) -> Self {
        self.entries.push(ConditionEntry::Group(Glue::Or, tree));
        self
    }

    pub(crate) fn merge(&mut self, other: ConditionTree) {
        self.entries.extend(other.entries);
    }

    pub(crate) fn entries(&self) -> &[ConditionEntry] {
        &self.entries
    }
}

/// Mutable compile-pass state shared by the clause assemblers.
pub(crate) struct AssembleContext<'a> {
    pub dialect: &'a dyn Dialect,
    pub root_alias: &'a str,
    pub registry: &'a mut AliasRegistry,
    pub cache: &'a mut ColumnCache,
    /// Join names referenced by WHERE/HAVING; drives outer-join pruning.
    pub used_joins: &'a mut BTreeSet<String>,
    /// Every join name referenced anywhere; checked by `validate_completeness`.
    pub referenced: &'a mut BTreeSet<String>,
}

impl<'a> AssembleContext<'a> {
    /// Parse and render one column reference. With `mark_used` the join it
    /// touches also counts towards outer-join pruning; references recorded
    /// for validation either way.
    pub(crate) fn resolve_spec(
        &mut self,
        spec: &ColumnSpec,
        mark_used: bool,
    ) -> QueryResult<String> {
        let descriptor = {
            let parse_ctx = ParseContext {
                dialect: self.dialect,
                root_alias: self.root_alias,
                registry: &*self.registry,
            };
            column::parse(spec, None, None, &parse_ctx, self.cache)?
        };
        let prefix = match &descriptor.join_name {
            Some(join) => {
                if mark_used {
                    self.used_joins.insert(join.clone());
                }
                self.referenced.insert(join.clone());
                Some(self.registry.shorten(join)?)
            }
            None => None,
        };
        if let Some(parent) = &descriptor.parent {
            self.referenced.insert(parent.clone());
        }
        Ok(descriptor.render(self.dialect, prefix.as_deref()))
    }

    fn resolve_column(&mut self, spec: &str) -> QueryResult<String> {
        self.resolve_spec(&ColumnSpec::Named(spec.to_string()), true)
    }

    fn type_hint(&mut self, spec: &str) -> Option<String> {
        // the descriptor was just cached by resolve_column
        self.cache
            .get(&(spec.to_string(), None, None))
            .and_then(|d| d.type_cast.clone())
    }
}

/// Render a condition tree into an SQL boolean expression. Returns an empty
/// string for an empty tree so callers can omit the clause keyword.
pub(crate) fn assemble(
    tree: &ConditionTree,
    glue: Glue,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    let mut parts = Vec::with_capacity(tree.entries().len());
    for entry in tree.entries() {
        match entry {
            ConditionEntry::Raw(expr) => parts.push(ctx.dialect.quote_expression(expr)),
            ConditionEntry::Group(inner_glue, sub) => {
                let inner = assemble(sub, *inner_glue, ctx)?;
                if !inner.is_empty() {
                    parts.push(format!("({inner})"));
                }
            }
            ConditionEntry::Predicate(key, value) => {
                parts.push(assemble_predicate(key, value, ctx)?);
            }
        }
    }
    Ok(parts.join(&format!(" {} ", glue.to_sql())))
}

/// Split a condition key into its column spec and optional operator suffix.
///
/// The operator is matched end-anchored, longest suffix first, so whitespace
/// inside the column spec itself (quoted JSON selector keys like
/// `data->>'my key'`) never trips the operator vocabulary. A key whose tail
/// parses as no known operator is taken whole as the column and left to
/// identifier validation.
fn split_key(key: &str) -> QueryResult<(&str, Option<Comparison>)> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(QueryError::InvalidSpecification(
            "empty condition key".to_string(),
        ));
    }
    for words in [2, 1] {
        if let Some((column, op)) = split_operator_suffix(trimmed, words) {
            return Ok((column, Some(op)));
        }
    }
    Ok((trimmed, None))
}

fn split_operator_suffix(key: &str, words: usize) -> Option<(&str, Comparison)> {
    let mut end = key.len();
    for _ in 0..words {
        end = key[..end].trim_end().rfind(char::is_whitespace)?;
    }
    let column = key[..end].trim_end();
    if column.is_empty() {
        return None;
    }
    let suffix = key[end..].split_whitespace().collect::<Vec<_>>().join(" ");
    let op = Comparison::parse(&suffix)?;
    Some((column, op))
}

fn unsupported(op: Comparison, value: impl std::fmt::Display) -> QueryError {
    QueryError::UnsupportedOperator {
        operator: op.to_sql().to_string(),
        value: value.to_string(),
    }
}

fn assemble_predicate(
    key: &str,
    value: &ConditionValue,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    let (column_spec, op) = split_key(key)?;
    let column_sql = ctx.resolve_column(column_spec)?;
    let hint = ctx.type_hint(column_spec);

    match value {
        ConditionValue::Scalar(Value::Null) => render_null(&column_sql, op),
        ConditionValue::Scalar(Value::Array(items)) => {
            render_array(&column_sql, op, items, value, hint.as_deref(), ctx)
        }
        ConditionValue::Scalar(scalar) => {
            let op = normalize_concrete(op, scalar)?;
            let op_sql = ctx.dialect.convert_operator(op, value);
            let quoted = ctx.dialect.quote_value(scalar, hint.as_deref())?;
            match op {
                Comparison::In | Comparison::NotIn => {
                    Ok(format!("{column_sql} {op_sql} ({quoted})"))
                }
                _ => Ok(format!("{column_sql} {op_sql} {quoted}")),
            }
        }
        ConditionValue::Expression(expr) => {
            let op = match op {
                None => Comparison::Eq,
                Some(Comparison::Is) => Comparison::Eq,
                Some(Comparison::IsNot) => Comparison::Ne,
                Some(Comparison::Between) | Some(Comparison::NotBetween) => {
                    return Err(unsupported(
                        op.unwrap_or(Comparison::Between),
                        expr.as_str(),
                    ));
                }
                Some(other) => other,
            };
            let op_sql = ctx.dialect.convert_operator(op, value);
            Ok(format!(
                "{column_sql} {op_sql} {}",
                ctx.dialect.quote_expression(expr)
            ))
        }
        ConditionValue::Nested(_) => Err(QueryError::InvalidSpecification(format!(
            "nested condition tree under '{key}' must be grouped with AND/OR"
        ))),
        ConditionValue::SubQuery(query) => {
            let op = match op {
                None | Some(Comparison::In) | Some(Comparison::Eq) => Comparison::In,
                Some(Comparison::NotIn) | Some(Comparison::Ne) | Some(Comparison::IsNot) => {
                    Comparison::NotIn
                }
                Some(other) => other,
            };
            let mut sub = (**query).clone();
            let sub_sql = sub.compile()?;
            let op_sql = ctx.dialect.convert_operator(op, value);
            Ok(format!("{column_sql} {op_sql} ({sub_sql})"))
        }
    }
}

/// `null` forces `IS` / `IS NOT`.
fn render_null(column_sql: &str, op: Option<Comparison>) -> QueryResult<String> {
    match op {
        None | Some(Comparison::Eq) | Some(Comparison::Is) | Some(Comparison::In) => {
            Ok(format!("{column_sql} IS NULL"))
        }
        Some(Comparison::Ne) | Some(Comparison::IsNot) | Some(Comparison::NotIn) => {
            Ok(format!("{column_sql} IS NOT NULL"))
        }
        Some(other) => Err(unsupported(other, "null")),
    }
}

/// `IS`/`NOT`-style operators applied to a concrete value normalize to
/// plain (in)equality.
fn normalize_concrete(op: Option<Comparison>, value: &Value) -> QueryResult<Comparison> {
    match op {
        None | Some(Comparison::Is) => Ok(Comparison::Eq),
        Some(Comparison::IsNot) => Ok(Comparison::Ne),
        Some(Comparison::Between) | Some(Comparison::NotBetween) => Err(unsupported(
            op.unwrap_or(Comparison::Between),
            value,
        )),
        Some(other) => Ok(other),
    }
}

fn render_array(
    column_sql: &str,
    op: Option<Comparison>,
    items: &[Value],
    value: &ConditionValue,
    hint: Option<&str>,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    match op {
        Some(Comparison::Between) | Some(Comparison::NotBetween) => {
            let op = op.unwrap_or(Comparison::Between);
            let [low, high] = items else {
                return Err(unsupported(op, Value::Array(items.to_vec())));
            };
            if matches!(low, Value::Null | Value::Bool(_))
                || matches!(high, Value::Null | Value::Bool(_))
            {
                return Err(unsupported(op, Value::Array(items.to_vec())));
            }
            let op_sql = ctx.dialect.convert_operator(op, value);
            Ok(format!(
                "{column_sql} {op_sql} {} AND {}",
                ctx.dialect.quote_value(low, hint)?,
                ctx.dialect.quote_value(high, hint)?
            ))
        }
        None | Some(Comparison::Eq) | Some(Comparison::In) => {
            if items.is_empty() {
                // an empty IN list can never match
                return Ok("1=0".to_string());
            }
            let op_sql = ctx.dialect.convert_operator(Comparison::In, value);
            Ok(format!(
                "{column_sql} {op_sql} ({})",
                quote_list(items, hint, ctx)?
            ))
        }
        Some(Comparison::Ne) | Some(Comparison::IsNot) | Some(Comparison::NotIn) => {
            if items.is_empty() {
                // an empty NOT IN list always matches
                return Ok("1=1".to_string());
            }
            let op_sql = ctx.dialect.convert_operator(Comparison::NotIn, value);
            Ok(format!(
                "{column_sql} {op_sql} ({})",
                quote_list(items, hint, ctx)?
            ))
        }
        Some(other) => {
            if items.is_empty() {
                return Err(unsupported(other, Value::Array(items.to_vec())));
            }
            let op_sql = ctx.dialect.convert_operator(other, value);
            Ok(format!(
                "{column_sql} {op_sql} ({})",
                quote_list(items, hint, ctx)?
            ))
        }
    }
}

fn quote_list(
    items: &[Value],
    hint: Option<&str>,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| ctx.dialect.quote_value(item, hint))
        .collect::<QueryResult<_>>()?;
    Ok(quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use serde_json::json;

    fn render(tree: &ConditionTree) -> QueryResult<String> {
        let mut registry = AliasRegistry::new(Some(1));
        let mut cache = ColumnCache::new();
        let mut used = BTreeSet::new();
        let mut referenced = BTreeSet::new();
        let mut ctx = AssembleContext {
            dialect: &PostgresDialect,
            root_alias: "Users",
            registry: &mut registry,
            cache: &mut cache,
            used_joins: &mut used,
            referenced: &mut referenced,
        };
        assemble(tree, Glue::And, &mut ctx)
    }

    #[test]
    fn test_empty_tree_renders_empty() {
        assert_eq!(render(&ConditionTree::new()).unwrap(), "");
    }

    #[test]
    fn test_default_operator_is_equality() {
        let tree = ConditionTree::new().push("status", json!("active"));
        assert_eq!(render(&tree).unwrap(), "\"status\" = 'active'");
    }

    #[test]
    fn test_array_value_forces_in() {
        let tree = ConditionTree::new().push("status", json!(["active", "pending"]));
        assert_eq!(
            render(&tree).unwrap(),
            "\"status\" IN ('active', 'pending')"
        );
    }

    #[test]
    fn test_negated_array_value_forces_not_in() {
        let tree = ConditionTree::new().push("status !=", json!(["archived", "deleted"]));
        assert_eq!(
            render(&tree).unwrap(),
            "\"status\" NOT IN ('archived', 'deleted')"
        );
    }

    #[test]
    fn test_null_forces_is() {
        let tree = ConditionTree::new().push("deleted_at", json!(null));
        assert_eq!(render(&tree).unwrap(), "\"deleted_at\" IS NULL");

        let tree = ConditionTree::new().push("status !=", json!(null));
        assert_eq!(render(&tree).unwrap(), "\"status\" IS NOT NULL");
    }

    #[test]
    fn test_null_under_inequality_is_unsupported() {
        let tree = ConditionTree::new().push("age >", json!(null));
        assert!(matches!(
            render(&tree).unwrap_err(),
            QueryError::UnsupportedOperator { .. }
        ));
    }

    #[test]
    fn test_between_renders_two_bounds() {
        let tree = ConditionTree::new().push("age between", json!([18, 65]));
        assert_eq!(render(&tree).unwrap(), "\"age\" BETWEEN 18 AND 65");

        let tree = ConditionTree::new().push("age not between", json!([18, 65]));
        assert_eq!(render(&tree).unwrap(), "\"age\" NOT BETWEEN 18 AND 65");
    }

    #[test]
    fn test_between_rejects_wrong_shapes() {
        for value in [json!([18]), json!([18, 30, 65]), json!([null, 5]), json!([true, 5])] {
            let tree = ConditionTree::new().push("age between", value);
            assert!(matches!(
                render(&tree).unwrap_err(),
                QueryError::UnsupportedOperator { .. }
            ));
        }
    }

    #[test]
    fn test_is_normalizes_on_concrete_value() {
        let tree = ConditionTree::new().push("status is", json!("active"));
        assert_eq!(render(&tree).unwrap(), "\"status\" = 'active'");

        let tree = ConditionTree::new().push("status is not", json!("active"));
        assert_eq!(render(&tree).unwrap(), "\"status\" != 'active'");

        let tree = ConditionTree::new().push("status not", json!("active"));
        assert_eq!(render(&tree).unwrap(), "\"status\" != 'active'");
    }

    #[test]
    fn test_comparison_suffixes() {
        let tree = ConditionTree::new()
            .push("age >=", json!(18))
            .push("age <", json!(65))
            .push("name like", json!("A%"));
        assert_eq!(
            render(&tree).unwrap(),
            "\"age\" >= 18 AND \"age\" < 65 AND \"name\" LIKE 'A%'"
        );
    }

    #[test]
    fn test_or_group_wraps_in_parentheses() {
        let tree = ConditionTree::new().push("active", json!(true)).or_group(
            ConditionTree::new()
                .push("role", json!("admin"))
                .push("role", json!("owner")),
        );
        assert_eq!(
            render(&tree).unwrap(),
            "\"active\" = TRUE AND (\"role\" = 'admin' OR \"role\" = 'owner')"
        );
    }

    #[test]
    fn test_glue_key_with_nested_tree_opens_group() {
        let tree = ConditionTree::new().push(
            "OR",
            ConditionTree::new()
                .push("a", json!(1))
                .push("b", json!(2)),
        );
        assert_eq!(render(&tree).unwrap(), "(\"a\" = 1 OR \"b\" = 2)");
    }

    #[test]
    fn test_raw_fragment_passes_through() {
        let tree = ConditionTree::new()
            .raw("char_length(name) > 3")
            .push("active", json!(true));
        assert_eq!(
            render(&tree).unwrap(),
            "char_length(name) > 3 AND \"active\" = TRUE"
        );
    }

    #[test]
    fn test_expression_value_is_not_quoted() {
        let tree = ConditionTree::new().push("updated_at >", SqlExpression::new("now()"));
        assert_eq!(render(&tree).unwrap(), "\"updated_at\" > now()");
    }

    #[test]
    fn test_empty_in_lists_use_constant_predicates() {
        let tree = ConditionTree::new().push("id", json!([]));
        assert_eq!(render(&tree).unwrap(), "1=0");

        let tree = ConditionTree::new().push("id not in", json!([]));
        assert_eq!(render(&tree).unwrap(), "1=1");
    }

    #[test]
    fn test_containment_operator_renders_list() {
        let tree = ConditionTree::new().push("tags &&", json!(["red", "blue"]));
        assert_eq!(render(&tree).unwrap(), "\"tags\" && ('red', 'blue')");
    }

    #[test]
    fn test_join_column_records_usage() {
        let mut registry = AliasRegistry::new(Some(1));
        let mut cache = ColumnCache::new();
        let mut used = BTreeSet::new();
        let mut referenced = BTreeSet::new();
        let mut ctx = AssembleContext {
            dialect: &PostgresDialect,
            root_alias: "Users",
            registry: &mut registry,
            cache: &mut cache,
            used_joins: &mut used,
            referenced: &mut referenced,
        };
        let tree = ConditionTree::new().push("Orders.total >", json!(100));
        let sql = assemble(&tree, Glue::And, &mut ctx).unwrap();
        assert_eq!(sql, "\"Orders\".\"total\" > 100");
        assert!(used.contains("Orders"));
        assert!(referenced.contains("Orders"));
    }

    #[test]
    fn test_json_selector_key_with_inner_whitespace() {
        let tree = ConditionTree::new().push("data->>'my key'", json!("x"));
        assert_eq!(render(&tree).unwrap(), "\"data\"->>'my key' = 'x'");

        let tree = ConditionTree::new().push("data->>'my key' !=", json!(null));
        assert_eq!(render(&tree).unwrap(), "\"data\"->>'my key' IS NOT NULL");

        let tree = ConditionTree::new().push("data->>'my key' not in", json!(["a", "b"]));
        assert_eq!(
            render(&tree).unwrap(),
            "\"data\"->>'my key' NOT IN ('a', 'b')"
        );
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let tree = ConditionTree::new().push("age ~~", json!(5));
        assert!(matches!(
            render(&tree).unwrap_err(),
            QueryError::InvalidSpecification(_)
        ));
    }
}
