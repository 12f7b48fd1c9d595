//! Join descriptors and JOIN clause rendering

use indexmap::IndexMap;
use std::collections::BTreeSet;

use crate::compiler::column::ColumnSpec;
use crate::compiler::condition::{AssembleContext, ConditionTree, Glue, assemble};
use crate::errors::QueryResult;
use crate::expression::SqlExpression;

/// Type of SQL JOIN operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinType {
    pub fn to_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL OUTER JOIN",
            JoinType::Cross => "CROSS JOIN",
        }
    }
}

/// Which columns a join contributes to the select list.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinColumns {
    /// `"Join".*`
    All,
    /// the join only filters, selecting nothing
    None,
    List(Vec<ColumnSpec>),
}

impl JoinColumns {
    pub fn list<I>(columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ColumnSpec>,
    {
        JoinColumns::List(columns.into_iter().map(Into::into).collect())
    }
}

/// One side of a join's ON equality.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinColumnRef {
    Named(String),
    Expression(SqlExpression),
}

impl From<&str> for JoinColumnRef {
    fn from(name: &str) -> Self {
        JoinColumnRef::Named(name.to_string())
    }
}

impl From<String> for JoinColumnRef {
    fn from(name: String) -> Self {
        JoinColumnRef::Named(name)
    }
}

impl From<SqlExpression> for JoinColumnRef {
    fn from(expr: SqlExpression) -> Self {
        JoinColumnRef::Expression(expr)
    }
}

/// A declared join, registered once per name with the query compiler.
///
/// `local_alias` names the side the join hangs off: the root alias for a
/// direct join, or another join's name for a deep join.
#[derive(Debug, Clone)]
pub struct JoinDescriptor {
    pub(crate) name: String,
    pub(crate) kind: JoinType,
    pub(crate) local_alias: String,
    pub(crate) local_column: JoinColumnRef,
    pub(crate) foreign_table: String,
    pub(crate) foreign_schema: Option<String>,
    pub(crate) foreign_column: JoinColumnRef,
    pub(crate) extra: ConditionTree,
    pub(crate) columns: JoinColumns,
    /// Cross joins carry an arbitrary sub-query expression instead of a table
    pub(crate) subquery: Option<SqlExpression>,
}

impl JoinDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: JoinType,
        local_alias: impl Into<String>,
        local_column: impl Into<JoinColumnRef>,
        foreign_table: impl Into<String>,
        foreign_column: impl Into<JoinColumnRef>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            local_alias: local_alias.into(),
            local_column: local_column.into(),
            foreign_table: foreign_table.into(),
            foreign_schema: None,
            foreign_column: foreign_column.into(),
            extra: ConditionTree::new(),
            columns: JoinColumns::All,
            subquery: None,
        }
    }

    /// A cross join against an arbitrary sub-query expression.
    pub fn cross(name: impl Into<String>, subquery: impl Into<SqlExpression>) -> Self {
        Self {
            name: name.into(),
            kind: JoinType::Cross,
            local_alias: String::new(),
            local_column: JoinColumnRef::Named(String::new()),
            foreign_table: String::new(),
            foreign_schema: None,
            foreign_column: JoinColumnRef::Named(String::new()),
            extra: ConditionTree::new(),
            columns: JoinColumns::None,
            subquery: Some(subquery.into()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.foreign_schema = Some(schema.into());
        self
    }

    pub fn with_columns(mut self, columns: JoinColumns) -> Self {
        self.columns = columns;
        self
    }

    /// Extra ON conditions, ANDed with the join equality.
    pub fn with_condition(mut self, tree: ConditionTree) -> Self {
        self.extra = tree;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join names are PascalCase record keys: `^[A-Z][A-Za-z0-9]*$`.
    pub(crate) fn has_valid_name(&self) -> bool {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_uppercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric())
    }

    /// Everything a join needs to render must be set. Cross joins instead
    /// carry a sub-query expression and are always valid.
    pub fn is_valid(&self) -> bool {
        if self.kind == JoinType::Cross {
            return self.subquery.is_some();
        }
        let column_set = |column: &JoinColumnRef| match column {
            JoinColumnRef::Named(name) => !name.is_empty(),
            JoinColumnRef::Expression(expr) => !expr.as_str().is_empty(),
        };
        !self.name.is_empty()
            && !self.local_alias.is_empty()
            && column_set(&self.local_column)
            && !self.foreign_table.is_empty()
            && column_set(&self.foreign_column)
    }
}

fn render_on_side(
    column: &JoinColumnRef,
    table_alias: &str,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    match column {
        JoinColumnRef::Expression(expr) => Ok(ctx.dialect.quote_expression(expr)),
        JoinColumnRef::Named(name) => {
            let short = ctx.registry.shorten(table_alias)?;
            Ok(format!(
                "{}.{}",
                ctx.dialect.quote_identifier(&short),
                ctx.dialect.quote_identifier(name)
            ))
        }
    }
}

/// Render all registered joins in registration order.
///
/// With `drop_unused_outer` set, a LEFT join whose name never appeared in the
/// WHERE/HAVING used-set is skipped entirely; COUNT/EXISTS queries rely on
/// this to avoid touching outer-joined tables they don't filter on. A join a
/// retained join hangs off is never skipped: its alias still appears in the
/// child's ON clause, so the whole ancestor chain must stay joined.
pub(crate) fn render_joins(
    joins: &IndexMap<String, JoinDescriptor>,
    drop_unused_outer: bool,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    let retained = if drop_unused_outer {
        Some(retained_joins(joins, ctx.used_joins))
    } else {
        None
    };
    let mut clauses = Vec::with_capacity(joins.len());
    for join in joins.values() {
        if let Some(keep) = &retained
            && !keep.contains(&join.name)
        {
            continue;
        }
        clauses.push(render_join(join, ctx)?);
    }
    Ok(clauses.join(" "))
}

/// Joins surviving a pruning pass: every non-LEFT join, every LEFT join named
/// in the used-set, and transitively every join a survivor's `local_alias`
/// points at.
fn retained_joins(
    joins: &IndexMap<String, JoinDescriptor>,
    used: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut keep: BTreeSet<String> = joins
        .values()
        .filter(|join| join.kind != JoinType::Left || used.contains(&join.name))
        .map(|join| join.name.clone())
        .collect();
    loop {
        let parents: Vec<String> = joins
            .values()
            .filter(|join| keep.contains(&join.name) && joins.contains_key(&join.local_alias))
            .map(|join| join.local_alias.clone())
            .collect();
        let mut grew = false;
        for parent in parents {
            grew |= keep.insert(parent);
        }
        if !grew {
            break;
        }
    }
    keep
}

fn render_join(join: &JoinDescriptor, ctx: &mut AssembleContext<'_>) -> QueryResult<String> {
    let short = ctx.registry.shorten(&join.name)?;
    let quoted_short = ctx.dialect.quote_identifier(&short);

    if let Some(subquery) = &join.subquery {
        return Ok(format!(
            "{} ({}) AS {quoted_short}",
            join.kind.to_sql(),
            ctx.dialect.quote_expression(subquery)
        ));
    }

    if join.local_alias != ctx.root_alias {
        ctx.referenced.insert(join.local_alias.clone());
    }

    let table = match &join.foreign_schema {
        Some(schema) if ctx.dialect.supports_schema_qualified_names() => format!(
            "{}.{}",
            ctx.dialect.quote_identifier(schema),
            ctx.dialect.quote_identifier(&join.foreign_table)
        ),
        _ => ctx.dialect.quote_identifier(&join.foreign_table),
    };

    let local = render_on_side(&join.local_column, &join.local_alias, ctx)?;
    let foreign = render_on_side(&join.foreign_column, &join.name, ctx)?;
    let mut on = format!("{local} = {foreign}");
    let extra = assemble(&join.extra, Glue::And, ctx)?;
    if !extra.is_empty() {
        on.push_str(" AND ");
        on.push_str(&extra);
    }

    Ok(format!(
        "{} {table} AS {quoted_short} ON ({on})",
        join.kind.to_sql()
    ))
}
