//! Column specification parsing
//!
//! Turns raw column expressions — plain names, `Join.column` references,
//! `::typecast` suffixes, inline `AS` aliases, JSON selectors, opaque
//! expressions — into normalized [`ColumnDescriptor`]s.

use std::collections::HashMap;

use crate::compiler::alias::AliasRegistry;
use crate::dialect::{Dialect, find_json_operator};
use crate::errors::{QueryError, QueryResult};
use crate::expression::SqlExpression;

/// Raw column specification accepted by the builder.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSpec {
    /// `"id"`, `"Orders.total"`, `"created::date AS day"`, `"data->>'name'"`
    Named(String),
    /// Raw SQL selected verbatim; pair with an alias to keep result keys stable
    Expression(SqlExpression),
    /// `*`
    Wildcard,
    /// Inline per-join column list, merged into the join's selection
    Join {
        name: String,
        columns: Vec<ColumnSpec>,
    },
}

impl From<&str> for ColumnSpec {
    fn from(spec: &str) -> Self {
        if spec.trim() == "*" {
            ColumnSpec::Wildcard
        } else {
            ColumnSpec::Named(spec.to_string())
        }
    }
}

impl From<String> for ColumnSpec {
    fn from(spec: String) -> Self {
        ColumnSpec::from(spec.as_str())
    }
}

impl From<SqlExpression> for ColumnSpec {
    fn from(expr: SqlExpression) -> Self {
        ColumnSpec::Expression(expr)
    }
}

/// Resolved base name of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnName {
    Named(String),
    Expression(SqlExpression),
    Wildcard,
}

/// Normalized, immutable result of parsing one column specification.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: ColumnName,
    pub alias: Option<String>,
    /// `None` means the root table.
    pub join_name: Option<String>,
    pub type_cast: Option<String>,
    /// Full selector text (e.g. `data->>'name'`) when the name is a JSON
    /// selector; `name` then holds only the base identifier.
    pub json_selector: Option<String>,
    /// Synthetic marker for joins referenced through another join; consumed
    /// only by the row denormalizer.
    pub parent: Option<String>,
}

pub(crate) type CacheKey = (String, Option<String>, Option<String>);
pub(crate) type ColumnCache = HashMap<CacheKey, ColumnDescriptor>;

pub(crate) struct ParseContext<'a> {
    pub dialect: &'a dyn Dialect,
    pub root_alias: &'a str,
    pub registry: &'a AliasRegistry,
}

impl ParseContext<'_> {
    /// A join name equal to the root alias — or to a short alias mapping back
    /// to the root — means "root table", not a join.
    fn normalize_join(&self, join: &str) -> Option<String> {
        if self.registry.resolves_to(join, self.root_alias) {
            None
        } else {
            Some(join.to_string())
        }
    }
}

/// Parse one column specification into a descriptor.
///
/// Parsing is pure apart from the memo cache: identical `(spec, alias, join)`
/// triples are parsed once and reused until the builder's column list is
/// replaced.
pub(crate) fn parse(
    spec: &ColumnSpec,
    explicit_alias: Option<&str>,
    explicit_join: Option<&str>,
    ctx: &ParseContext<'_>,
    cache: &mut ColumnCache,
) -> QueryResult<ColumnDescriptor> {
    if explicit_alias.is_some_and(str::is_empty) {
        return Err(QueryError::InvalidSpecification(
            "explicit column alias must not be empty".to_string(),
        ));
    }
    if explicit_join.is_some_and(str::is_empty) {
        return Err(QueryError::InvalidSpecification(
            "explicit join name must not be empty".to_string(),
        ));
    }

    match spec {
        ColumnSpec::Wildcard => Ok(ColumnDescriptor {
            name: ColumnName::Wildcard,
            // the wildcard strips alias and typecast
            alias: None,
            join_name: explicit_join.and_then(|j| ctx.normalize_join(j)),
            type_cast: None,
            json_selector: None,
            parent: None,
        }),
        ColumnSpec::Expression(expr) => Ok(ColumnDescriptor {
            name: ColumnName::Expression(expr.clone()),
            alias: explicit_alias.map(str::to_string),
            join_name: explicit_join.and_then(|j| ctx.normalize_join(j)),
            type_cast: None,
            json_selector: None,
            parent: None,
        }),
        ColumnSpec::Join { name, .. } => Err(QueryError::InvalidSpecification(format!(
            "nested join column list '{name}' is only valid in a select list"
        ))),
        ColumnSpec::Named(raw) => {
            let key: CacheKey = (
                raw.clone(),
                explicit_alias.map(str::to_string),
                explicit_join.map(str::to_string),
            );
            if let Some(descriptor) = cache.get(&key) {
                return Ok(descriptor.clone());
            }
            let descriptor = parse_named(raw, explicit_alias, explicit_join, ctx)?;
            cache.insert(key, descriptor.clone());
            Ok(descriptor)
        }
    }
}

fn parse_named(
    raw: &str,
    explicit_alias: Option<&str>,
    explicit_join: Option<&str>,
    ctx: &ParseContext<'_>,
) -> QueryResult<ColumnDescriptor> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(QueryError::InvalidSpecification(
            "empty column specification".to_string(),
        ));
    }

    // inline `AS alias` suffix
    let (base, inline_alias) = split_inline_alias(trimmed);

    // `::typecast` suffix
    let (base, type_cast) = split_type_cast(base)?;

    // single `JoinName.` prefix
    let (prefix, name_part) = split_join_prefix(base)?;

    let alias = explicit_alias.map(str::to_string).or(inline_alias);

    // implicit prefix wins; an explicit join that disagrees becomes the
    // nested-join parent marker
    let implicit = prefix.and_then(|p| ctx.normalize_join(p));
    let explicit = explicit_join.and_then(|j| ctx.normalize_join(j));
    let (join_name, parent) = match (implicit, explicit) {
        (Some(i), Some(e)) if i != e => (Some(i), Some(e)),
        (Some(i), _) => (Some(i), None),
        (None, e) => (e, None),
    };

    if name_part == "*" {
        // the wildcard strips alias and typecast
        return Ok(ColumnDescriptor {
            name: ColumnName::Wildcard,
            alias: None,
            join_name,
            type_cast: None,
            json_selector: None,
            parent,
        });
    }

    if !ctx.dialect.is_valid_identifier(name_part, true) {
        return Err(QueryError::InvalidSpecification(format!(
            "'{name_part}' is not a valid column name"
        )));
    }

    let (name, json_selector) = match find_json_operator(name_part) {
        Some(idx) => (
            ColumnName::Named(name_part[..idx].to_string()),
            Some(name_part.to_string()),
        ),
        None => (ColumnName::Named(name_part.to_string()), None),
    };

    Ok(ColumnDescriptor {
        name,
        alias,
        join_name,
        type_cast,
        json_selector,
        parent,
    })
}

/// Split an inline `AS alias` suffix. Falls back to "no alias" unless the
/// alias side is a plain identifier, so quoted JSON keys containing ` as `
/// are left alone.
fn split_inline_alias(spec: &str) -> (&str, Option<String>) {
    let lower = spec.to_ascii_lowercase();
    let Some(idx) = lower.rfind(" as ") else {
        return (spec, None);
    };
    let base = spec[..idx].trim_end();
    let alias = spec[idx + 4..].trim();
    if base.is_empty() || !crate::dialect::is_plain_identifier(alias) {
        return (spec, None);
    }
    (base, Some(alias.to_string()))
}

fn split_type_cast(spec: &str) -> QueryResult<(&str, Option<String>)> {
    let Some(idx) = spec.rfind("::") else {
        return Ok((spec, None));
    };
    let base = &spec[..idx];
    let cast = spec[idx + 2..].trim();
    let cast_ok = !cast.is_empty()
        && cast
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ');
    if base.is_empty() || !cast_ok {
        return Err(QueryError::InvalidSpecification(format!(
            "malformed typecast in column specification '{spec}'"
        )));
    }
    Ok((base, Some(cast.to_string())))
}

/// Split a leading `JoinName.` prefix. Only a single dot is allowed; dots
/// inside JSON selector keys (after the first selector operator) are fine.
fn split_join_prefix(spec: &str) -> QueryResult<(Option<&str>, &str)> {
    let limit = find_json_operator(spec).unwrap_or(spec.len());
    let Some(dot) = spec[..limit].find('.') else {
        return Ok((None, spec));
    };
    let prefix = &spec[..dot];
    let rest = &spec[dot + 1..];
    if prefix.is_empty() || rest.is_empty() {
        return Err(QueryError::InvalidSpecification(format!(
            "malformed column reference '{spec}'"
        )));
    }
    let rest_limit = find_json_operator(rest).unwrap_or(rest.len());
    if rest[..rest_limit].contains('.') {
        return Err(QueryError::InvalidSpecification(format!(
            "'{spec}' nests deeper than one join prefix"
        )));
    }
    Ok((Some(prefix), rest))
}

impl ColumnDescriptor {
    /// SQL for the column reference itself, without any output alias.
    pub(crate) fn render(&self, dialect: &dyn Dialect, table_prefix: Option<&str>) -> String {
        let base = match &self.name {
            ColumnName::Wildcard => "*".to_string(),
            ColumnName::Expression(expr) => dialect.quote_expression(expr),
            ColumnName::Named(name) => match &self.json_selector {
                Some(selector) => {
                    // quote the base identifier, keep the validated selector tail
                    let tail = &selector[name.len()..];
                    format!("{}{}", dialect.quote_identifier(name), tail)
                }
                None => dialect.quote_identifier(name),
            },
        };
        let mut sql = match (&self.name, table_prefix) {
            (ColumnName::Expression(_), _) | (_, None) => base,
            (_, Some(table)) => format!("{}.{base}", dialect.quote_identifier(table)),
        };
        if let Some(cast) = &self.type_cast {
            sql.push_str("::");
            sql.push_str(cast);
        }
        sql
    }

    /// Long key this column contributes to the result row, used to build the
    /// `_<table>__<column>` select alias. `None` means the column cannot be
    /// re-keyed (wildcards, anonymous expressions) and is emitted bare.
    pub(crate) fn output_key(&self) -> Option<String> {
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        match &self.name {
            ColumnName::Named(name) => {
                Some(self.json_selector.clone().unwrap_or_else(|| name.clone()))
            }
            ColumnName::Expression(_) | ColumnName::Wildcard => None,
        }
    }
}
