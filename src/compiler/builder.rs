//! Query compiler (orchestrator)
//!
//! Holds the mutable builder state and assembles the final SQL text in a
//! fixed clause order: WITH, SELECT, FROM, joins, WHERE, GROUP BY, HAVING,
//! ORDER BY, LIMIT, OFFSET. Alias state is reset at the start of every
//! compile pass and kept afterwards so the row denormalizer can invert it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::compiler::alias::AliasRegistry;
use crate::compiler::column::{
    self, ColumnCache, ColumnDescriptor, ColumnSpec, ParseContext,
};
use crate::compiler::condition::{AssembleContext, ConditionTree, Glue, assemble};
use crate::compiler::denormalize::{JoinLink, RowDenormalizer};
use crate::compiler::join::{self, JoinColumns, JoinDescriptor};
use crate::compiler::ordering::SortDirection;
use crate::debug_log;
use crate::dialect::Dialect;
use crate::errors::{QueryError, QueryResult};

/// Which SELECT shape a compile pass produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryShape {
    Select,
    Count,
    Exists,
}

/// Explicit per-region dirty markers. A compile pass recomputes the parsed
/// column list only when the columns region changed, and a fully clean
/// builder reuses the SQL of its previous pass outright.
#[derive(Debug, Clone, Copy, Default)]
struct Dirty {
    columns: bool,
    joins: bool,
    filters: bool,
    grouping: bool,
    ordering: bool,
    paging: bool,
    with: bool,
}

impl Dirty {
    fn all() -> Self {
        Self {
            columns: true,
            joins: true,
            filters: true,
            grouping: true,
            ordering: true,
            paging: true,
            with: true,
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    fn any(&self) -> bool {
        self.columns
            || self.joins
            || self.filters
            || self.grouping
            || self.ordering
            || self.paging
            || self.with
    }
}

/// The SQL of the most recent compile pass, keyed by the parameters that
/// shaped it.
#[derive(Debug, Clone)]
struct CompiledPass {
    shape: QueryShape,
    drop_unused_outer_joins: bool,
    include_with: bool,
    sql: String,
}

#[derive(Debug, Clone)]
struct SelectItem {
    spec: ColumnSpec,
    alias: Option<String>,
}

/// Fluent SQL query builder and compiler.
///
/// Not safe for concurrent mutation; give each logical query its own instance
/// or clone one (clones deep-copy the join map, so joins stay independently
/// mutable afterwards).
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    dialect: Arc<dyn Dialect>,
    schema: Option<String>,
    table: String,
    root_alias: String,
    selects: Vec<SelectItem>,
    parsed: Option<Vec<ColumnDescriptor>>,
    inline_join_columns: IndexMap<String, Vec<ColumnSpec>>,
    cache: ColumnCache,
    distinct: bool,
    distinct_columns: Vec<ColumnSpec>,
    where_tree: ConditionTree,
    having_tree: ConditionTree,
    group_by: Vec<ColumnSpec>,
    order_by: IndexMap<String, (ColumnSpec, SortDirection)>,
    limit: Option<u64>,
    offset: Option<u64>,
    joins: IndexMap<String, JoinDescriptor>,
    ctes: IndexMap<String, QueryCompiler>,
    dirty: Dirty,
    last_pass: Option<CompiledPass>,
    alias_seed: Option<u64>,
    registry: AliasRegistry,
    /// Flat select alias -> (long table alias, long column key), captured
    /// during the last compile for the denormalizer.
    emitted: HashMap<String, (String, String)>,
}

impl QueryCompiler {
    pub fn new(
        dialect: Arc<dyn Dialect>,
        table: impl Into<String>,
        root_alias: impl Into<String>,
    ) -> Self {
        Self {
            dialect,
            schema: None,
            table: table.into(),
            root_alias: root_alias.into(),
            selects: Vec::new(),
            parsed: None,
            inline_join_columns: IndexMap::new(),
            cache: ColumnCache::new(),
            distinct: false,
            distinct_columns: Vec::new(),
            where_tree: ConditionTree::new(),
            having_tree: ConditionTree::new(),
            group_by: Vec::new(),
            order_by: IndexMap::new(),
            limit: None,
            offset: None,
            joins: IndexMap::new(),
            ctes: IndexMap::new(),
            dirty: Dirty::all(),
            last_pass: None,
            alias_seed: None,
            registry: AliasRegistry::new(None),
            emitted: HashMap::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.dirty = Dirty::all();
        self
    }

    /// Fix the random salt of the alias shortener so compiles are
    /// reproducible (used by tests and query logging comparisons).
    pub fn with_alias_seed(mut self, seed: u64) -> Self {
        self.alias_seed = Some(seed);
        self.dirty = Dirty::all();
        self
    }

    /// Replace the select list. Invalidates the parse cache wholesale.
    pub fn columns<I>(mut self, specs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ColumnSpec>,
    {
        self.selects = specs
            .into_iter()
            .map(|spec| SelectItem {
                spec: spec.into(),
                alias: None,
            })
            .collect();
        self.cache.clear();
        self.parsed = None;
        self.dirty.columns = true;
        self
    }

    /// Append a single column with an explicit output alias.
    pub fn column(mut self, spec: impl Into<ColumnSpec>, alias: Option<&str>) -> Self {
        self.selects.push(SelectItem {
            spec: spec.into(),
            alias: alias.map(str::to_string),
        });
        self.parsed = None;
        self.dirty.columns = true;
        self
    }

    pub fn distinct(mut self, flag: bool) -> Self {
        self.distinct = flag;
        if !flag {
            self.distinct_columns.clear();
        }
        self.dirty.columns = true;
        self
    }

    /// `DISTINCT ON (columns)`.
    pub fn distinct_on<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ColumnSpec>,
    {
        self.distinct = true;
        self.distinct_columns = columns.into_iter().map(Into::into).collect();
        self.dirty.columns = true;
        self
    }

    /// Replace the WHERE tree.
    pub fn filter(mut self, tree: ConditionTree) -> Self {
        self.where_tree = tree;
        self.dirty.filters = true;
        self
    }

    /// AND more conditions onto the existing WHERE tree.
    pub fn and_filter(mut self, tree: ConditionTree) -> Self {
        self.where_tree.merge(tree);
        self.dirty.filters = true;
        self
    }

    pub fn having(mut self, tree: ConditionTree) -> Self {
        self.having_tree = tree;
        self.dirty.filters = true;
        self
    }

    /// Append grouping columns.
    pub fn group_by<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ColumnSpec>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self.dirty.grouping = true;
        self
    }

    /// Append an ordering. Keyed by column spec, so ordering twice on the
    /// same column replaces the direction instead of duplicating the clause.
    pub fn order_by(
        mut self,
        column: impl Into<ColumnSpec>,
        direction: &str,
    ) -> QueryResult<Self> {
        let direction = SortDirection::parse(direction)?;
        let spec = column.into();
        let key = match &spec {
            ColumnSpec::Named(raw) => raw.clone(),
            ColumnSpec::Expression(expr) => expr.as_str().to_string(),
            ColumnSpec::Wildcard | ColumnSpec::Join { .. } => {
                return Err(QueryError::InvalidSpecification(
                    "cannot order by a wildcard or join column list".to_string(),
                ));
            }
        };
        self.order_by.insert(key, (spec, direction));
        self.dirty.ordering = true;
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self.dirty.paging = true;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self.dirty.paging = true;
        self
    }

    /// Advance the offset by one page.
    pub fn fetch_next_page(mut self) -> QueryResult<Self> {
        let limit = self.limit.ok_or(QueryError::PaginationWithoutLimit)?;
        self.offset = Some(self.offset.unwrap_or(0) + limit);
        self.dirty.paging = true;
        Ok(self)
    }

    /// Move the offset back by one page, stopping at zero.
    pub fn fetch_prev_page(mut self) -> QueryResult<Self> {
        let limit = self.limit.ok_or(QueryError::PaginationWithoutLimit)?;
        self.offset = Some(self.offset.unwrap_or(0).saturating_sub(limit));
        self.dirty.paging = true;
        Ok(self)
    }

    /// Register a join. Each join name may be registered once.
    pub fn join(mut self, join: JoinDescriptor) -> QueryResult<Self> {
        if !join.has_valid_name() {
            return Err(QueryError::InvalidJoin {
                name: join.name().to_string(),
                reason: "join name must match ^[A-Z][A-Za-z0-9]*$".to_string(),
            });
        }
        if !join.is_valid() {
            return Err(QueryError::InvalidJoin {
                name: join.name().to_string(),
                reason: "join is missing required fields".to_string(),
            });
        }
        if self.joins.contains_key(join.name()) {
            return Err(QueryError::DuplicateJoin(join.name().to_string()));
        }
        self.joins.insert(join.name().to_string(), join);
        self.dirty.joins = true;
        Ok(self)
    }

    /// Register a common-table-expression under `alias`. A CTE registered
    /// twice under the same alias is replaced.
    pub fn with(mut self, query: QueryCompiler, alias: impl Into<String>) -> QueryResult<Self> {
        let alias = alias.into();
        if !self.dialect.is_valid_identifier(&alias, false) {
            return Err(QueryError::InvalidSpecification(format!(
                "'{alias}' is not a valid WITH query alias"
            )));
        }
        self.ctes.insert(alias, query);
        self.dirty.with = true;
        Ok(self)
    }

    /// Compile the full SELECT.
    pub fn compile(&mut self) -> QueryResult<String> {
        let sql = self.compile_shape(QueryShape::Select, false, true)?;
        debug_log!("[COMPILE] SQL: {}", sql);
        Ok(sql)
    }

    /// Compile a `SELECT COUNT(*)` over the same joins and filters. ORDER BY
    /// and LIMIT/OFFSET are omitted; with `drop_unused_outer_joins`, LEFT
    /// joins never referenced by WHERE/HAVING are skipped.
    pub fn compile_count(&mut self, drop_unused_outer_joins: bool) -> QueryResult<String> {
        let sql = self.compile_shape(QueryShape::Count, drop_unused_outer_joins, true)?;
        debug_log!("[COMPILE_COUNT] SQL: {}", sql);
        Ok(sql)
    }

    /// Compile a `SELECT 1 ... LIMIT 1` existence probe.
    pub fn compile_exists(&mut self, drop_unused_outer_joins: bool) -> QueryResult<String> {
        let sql = self.compile_shape(QueryShape::Exists, drop_unused_outer_joins, true)?;
        debug_log!("[COMPILE_EXISTS] SQL: {}", sql);
        Ok(sql)
    }

    /// Compile parenthesized, for embedding as a sub-query.
    pub fn compile_as_subquery(&mut self) -> QueryResult<String> {
        Ok(format!("({})", self.compile()?))
    }

    /// A denormalizer sharing the alias state of the last compile pass.
    pub fn denormalizer(&self) -> RowDenormalizer {
        let links = self
            .joins
            .values()
            .map(|join| JoinLink {
                name: join.name.clone(),
                // cross joins hang off the root
                local_alias: if join.local_alias.is_empty() {
                    self.root_alias.clone()
                } else {
                    join.local_alias.clone()
                },
            })
            .collect();
        RowDenormalizer::new(
            self.root_alias.clone(),
            self.registry.reverse_table_map(),
            self.registry.reverse_column_map(),
            self.emitted.clone(),
            links,
        )
    }

    fn compile_shape(
        &mut self,
        shape: QueryShape,
        drop_unused_outer_joins: bool,
        include_with: bool,
    ) -> QueryResult<String> {
        // a clean builder reuses the previous pass wholesale; any setter
        // marks its region dirty and invalidates this
        if !self.dirty.any()
            && let Some(pass) = &self.last_pass
            && pass.shape == shape
            && pass.drop_unused_outer_joins == drop_unused_outer_joins
            && pass.include_with == include_with
        {
            return Ok(pass.sql.clone());
        }
        debug_log!("[COMPILE] regions changed since last pass: {:?}", self.dirty);

        // (1) fresh alias state for this pass
        let mut registry = AliasRegistry::new(self.alias_seed);
        let root_alias = self.root_alias.clone();
        let root_short = registry.shorten(&root_alias)?;
        let mut cache = std::mem::take(&mut self.cache);

        // (2) recompute the parsed column list only when the columns region
        // is dirty
        if self.dirty.columns || self.parsed.is_none() {
            let parse_ctx = ParseContext {
                dialect: self.dialect.as_ref(),
                root_alias: &root_alias,
                registry: &registry,
            };
            let (parsed, inline) = parse_select_items(&self.selects, &parse_ctx, &mut cache)?;
            self.parsed = Some(parsed);
            self.inline_join_columns = inline;
        }

        let dialect = Arc::clone(&self.dialect);
        let parsed = self.parsed.clone().unwrap_or_default();
        let inline_join_columns = self.inline_join_columns.clone();
        let where_tree = self.where_tree.clone();
        let having_tree = self.having_tree.clone();
        let group_by = self.group_by.clone();
        let order_by = self.order_by.clone();
        let distinct_columns = self.distinct_columns.clone();
        let joins = self.joins.clone();

        let mut used = BTreeSet::new();
        let mut referenced = BTreeSet::new();
        let mut emitted: HashMap<String, (String, String)> = HashMap::new();

        let mut ctx = AssembleContext {
            dialect: dialect.as_ref(),
            root_alias: &root_alias,
            registry: &mut registry,
            cache: &mut cache,
            used_joins: &mut used,
            referenced: &mut referenced,
        };

        // (3) WHERE/HAVING first: join pruning reads the used-set they record
        let where_sql = assemble(&where_tree, Glue::And, &mut ctx)?;
        let having_sql = assemble(&having_tree, Glue::And, &mut ctx)?;

        // (4) WITH: flatten nested CTE dependencies into one list
        let with_sql = if include_with {
            render_with(&self.ctes, &mut ctx)?
        } else {
            String::new()
        };

        // (5) select list
        let select_list = match shape {
            QueryShape::Count => "COUNT(*)".to_string(),
            QueryShape::Exists => "1".to_string(),
            QueryShape::Select => {
                let parts = render_select_list(
                    &parsed,
                    &joins,
                    &inline_join_columns,
                    &root_alias,
                    &root_short,
                    &mut emitted,
                    &mut ctx,
                )?;
                if parts.is_empty() {
                    return Err(QueryError::NoColumnsSelected);
                }
                parts.join(", ")
            }
        };

        // (6) remaining clauses in fixed order
        let from = match &self.schema {
            Some(schema) if ctx.dialect.supports_schema_qualified_names() => format!(
                "{}.{}",
                ctx.dialect.quote_identifier(schema),
                ctx.dialect.quote_identifier(&self.table)
            ),
            _ => ctx.dialect.quote_identifier(&self.table),
        };
        let joins_sql = join::render_joins(&joins, drop_unused_outer_joins, &mut ctx)?;

        let mut sql = String::new();
        if !with_sql.is_empty() {
            sql.push_str(&with_sql);
            sql.push(' ');
        }
        sql.push_str("SELECT ");
        if shape == QueryShape::Select && self.distinct {
            if distinct_columns.is_empty() {
                sql.push_str("DISTINCT ");
            } else {
                let columns: Vec<String> = distinct_columns
                    .iter()
                    .map(|spec| ctx.resolve_spec(spec, false))
                    .collect::<QueryResult<_>>()?;
                sql.push_str(&format!("DISTINCT ON ({}) ", columns.join(", ")));
            }
        }
        sql.push_str(&select_list);
        sql.push_str(" FROM ");
        sql.push_str(&from);
        sql.push_str(" AS ");
        sql.push_str(&ctx.dialect.quote_identifier(&root_short));
        if !joins_sql.is_empty() {
            sql.push(' ');
            sql.push_str(&joins_sql);
        }
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        if !group_by.is_empty() {
            let columns: Vec<String> = group_by
                .iter()
                .map(|spec| ctx.resolve_spec(spec, false))
                .collect::<QueryResult<_>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&columns.join(", "));
        }
        if !having_sql.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&having_sql);
        }
        match shape {
            QueryShape::Select => {
                if !order_by.is_empty() {
                    let orderings: Vec<String> = order_by
                        .values()
                        .map(|(spec, direction)| {
                            Ok(format!(
                                "{} {}",
                                ctx.resolve_spec(spec, false)?,
                                direction.to_sql()
                            ))
                        })
                        .collect::<QueryResult<_>>()?;
                    sql.push_str(" ORDER BY ");
                    sql.push_str(&orderings.join(", "));
                }
                if let Some(limit) = self.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                if let Some(offset) = self.offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
            }
            QueryShape::Exists => sql.push_str(" LIMIT 1"),
            QueryShape::Count => {}
        }

        // (7) every referenced alias needs a join or WITH query
        validate_completeness(&referenced, &joins, &self.ctes, &root_alias)?;

        // (8) persist this pass's alias state and clear dirty markers
        self.cache = cache;
        self.registry = registry;
        self.emitted = emitted;
        self.last_pass = Some(CompiledPass {
            shape,
            drop_unused_outer_joins,
            include_with,
            sql: sql.clone(),
        });
        self.dirty.clear();

        Ok(sql)
    }
}

fn parse_select_items(
    selects: &[SelectItem],
    ctx: &ParseContext<'_>,
    cache: &mut ColumnCache,
) -> QueryResult<(Vec<ColumnDescriptor>, IndexMap<String, Vec<ColumnSpec>>)> {
    let mut parsed = Vec::with_capacity(selects.len());
    let mut inline: IndexMap<String, Vec<ColumnSpec>> = IndexMap::new();
    for item in selects {
        if let ColumnSpec::Join { name, columns } = &item.spec {
            inline
                .entry(name.clone())
                .or_default()
                .extend(columns.iter().cloned());
            continue;
        }
        parsed.push(column::parse(
            &item.spec,
            item.alias.as_deref(),
            None,
            ctx,
            cache,
        )?);
    }
    Ok((parsed, inline))
}

fn render_select_list(
    parsed: &[ColumnDescriptor],
    joins: &IndexMap<String, JoinDescriptor>,
    inline_join_columns: &IndexMap<String, Vec<ColumnSpec>>,
    root_alias: &str,
    root_short: &str,
    emitted: &mut HashMap<String, (String, String)>,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<Vec<String>> {
    let mut parts = Vec::new();
    for descriptor in parsed {
        render_one_column(descriptor, root_alias, root_short, emitted, ctx, &mut parts)?;
    }
    for join in joins.values() {
        let inline = inline_join_columns.get(&join.name);
        let columns = match (inline, &join.columns) {
            (Some(specs), _) => JoinColumns::List(specs.clone()),
            (None, columns) => columns.clone(),
        };
        match columns {
            JoinColumns::None => {}
            JoinColumns::All => {
                ctx.referenced.insert(join.name.clone());
                let short = ctx.registry.shorten(&join.name)?;
                parts.push(format!("{}.*", ctx.dialect.quote_identifier(&short)));
            }
            JoinColumns::List(specs) => {
                for spec in &specs {
                    let descriptor = {
                        let parse_ctx = ParseContext {
                            dialect: ctx.dialect,
                            root_alias: ctx.root_alias,
                            registry: &*ctx.registry,
                        };
                        column::parse(spec, None, Some(join.name.as_str()), &parse_ctx, ctx.cache)?
                    };
                    render_one_column(
                        &descriptor,
                        root_alias,
                        root_short,
                        emitted,
                        ctx,
                        &mut parts,
                    )?;
                }
            }
        }
    }
    // inline column lists for join names that were never registered still
    // count as references, so validation reports them
    for name in inline_join_columns.keys() {
        ctx.referenced.insert(name.clone());
    }
    Ok(parts)
}

fn render_one_column(
    descriptor: &ColumnDescriptor,
    root_alias: &str,
    root_short: &str,
    emitted: &mut HashMap<String, (String, String)>,
    ctx: &mut AssembleContext<'_>,
    parts: &mut Vec<String>,
) -> QueryResult<()> {
    if let Some(join) = &descriptor.join_name {
        ctx.referenced.insert(join.clone());
    }
    if let Some(parent) = &descriptor.parent {
        ctx.referenced.insert(parent.clone());
    }
    let (long_table, short_table) = match &descriptor.join_name {
        Some(join) => (join.clone(), ctx.registry.shorten(join)?),
        None => (root_alias.to_string(), root_short.to_string()),
    };
    match descriptor.output_key() {
        Some(key) => {
            let short_column = ctx.registry.column_alias(&key)?;
            let flat = format!("_{short_table}__{short_column}");
            let rendered = descriptor.render(ctx.dialect, Some(&short_table));
            parts.push(format!(
                "{rendered} AS {}",
                ctx.dialect.quote_identifier(&flat)
            ));
            emitted.insert(flat, (long_table, key));
        }
        // wildcards and anonymous expressions cannot be re-keyed
        None => parts.push(descriptor.render(ctx.dialect, Some(&short_table))),
    }
    Ok(())
}

/// Flatten the CTE graph, dependencies first, and render one flat WITH list.
fn render_with(
    ctes: &IndexMap<String, QueryCompiler>,
    ctx: &mut AssembleContext<'_>,
) -> QueryResult<String> {
    if ctes.is_empty() {
        return Ok(String::new());
    }
    let flat = flatten_ctes(ctes)?;
    let mut rendered = Vec::with_capacity(flat.len());
    for (alias, query) in flat {
        let short = ctx.registry.shorten(&alias)?;
        let mut body = query;
        let body_sql = body.compile_shape(QueryShape::Select, false, false)?;
        rendered.push(format!(
            "{} AS ({body_sql})",
            ctx.dialect.quote_identifier(&short)
        ));
    }
    Ok(format!("WITH {}", rendered.join(", ")))
}

/// Topological flatten of the named sub-query dependency graph, dependencies
/// first. An alias reappearing on its own dependency path is a cycle and is
/// rejected; a duplicate alias on disjoint paths keeps its first definition.
fn flatten_ctes(
    ctes: &IndexMap<String, QueryCompiler>,
) -> QueryResult<IndexMap<String, QueryCompiler>> {
    fn visit(
        ctes: &IndexMap<String, QueryCompiler>,
        path: &mut Vec<String>,
        out: &mut IndexMap<String, QueryCompiler>,
    ) -> QueryResult<()> {
        for (alias, query) in ctes {
            if path.iter().any(|ancestor| ancestor == alias) {
                return Err(QueryError::InvalidSpecification(format!(
                    "WITH query '{alias}' participates in a dependency cycle"
                )));
            }
            if out.contains_key(alias) {
                continue;
            }
            path.push(alias.clone());
            visit(&query.ctes, path, out)?;
            path.pop();
            out.insert(alias.clone(), query.clone());
        }
        Ok(())
    }

    let mut out = IndexMap::new();
    visit(ctes, &mut Vec::new(), &mut out)?;
    Ok(out)
}

fn validate_completeness(
    referenced: &BTreeSet<String>,
    joins: &IndexMap<String, JoinDescriptor>,
    ctes: &IndexMap<String, QueryCompiler>,
    root_alias: &str,
) -> QueryResult<()> {
    let cte_aliases = flatten_ctes(ctes)?;
    let missing: Vec<String> = referenced
        .iter()
        .filter(|name| {
            name.as_str() != root_alias
                && !joins.contains_key(*name)
                && !cte_aliases.contains_key(*name)
        })
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(QueryError::MissingJoin(missing.join(", ")))
    }
}
