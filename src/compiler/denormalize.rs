//! Row denormalization
//!
//! Inverts the flat `_<table>__<column>` select aliases of a compiled query:
//! each flat result row becomes one nested record, join columns grouped into
//! sub-objects under their join name, deep joins grafted under their parent.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::trace_log;

/// Where a join hangs in the nested output: directly under the root record,
/// or under another join's sub-object.
#[derive(Debug, Clone)]
pub(crate) struct JoinLink {
    pub name: String,
    pub local_alias: String,
}

/// Rebuilds nested records from the flat rows a compiled query returns.
///
/// Obtained from [`QueryCompiler::denormalizer`] after a compile pass; it
/// carries that pass's alias maps, so it only decodes rows produced by the
/// SQL of the same pass.
///
/// [`QueryCompiler::denormalizer`]: crate::compiler::QueryCompiler::denormalizer
#[derive(Debug, Clone)]
pub struct RowDenormalizer {
    root_alias: String,
    /// short table alias -> long join/root alias
    tables_rev: HashMap<String, String>,
    /// short column alias -> long column key
    columns_rev: HashMap<String, String>,
    /// exact flat select alias -> (long table alias, long column key)
    emitted: HashMap<String, (String, String)>,
    joins: Vec<JoinLink>,
}

impl RowDenormalizer {
    pub(crate) fn new(
        root_alias: String,
        tables_rev: HashMap<String, String>,
        columns_rev: HashMap<String, String>,
        emitted: HashMap<String, (String, String)>,
        joins: Vec<JoinLink>,
    ) -> Self {
        Self {
            root_alias,
            tables_rev,
            columns_rev,
            emitted,
            joins,
        }
    }

    /// Denormalize one flat row into a nested record.
    ///
    /// Keys that don't decode as flat select aliases (aggregates, wildcard
    /// columns) land on the root record unchanged. Every registered join
    /// appears in the output, as an empty object when the row carried no
    /// columns for it; a join whose parent was never placed is dropped.
    pub fn denormalize(&self, row: &Map<String, Value>) -> Value {
        trace_log!("[DENORMALIZE] row with {} keys", row.len());

        let mut root = Map::new();
        let mut buckets: HashMap<String, Map<String, Value>> = HashMap::new();
        for (key, value) in row {
            match self.resolve_key(key) {
                Some((table, column)) if table != self.root_alias => {
                    buckets.entry(table).or_default().insert(column, value.clone());
                }
                Some((_, column)) => {
                    root.insert(column, value.clone());
                }
                None => {
                    root.insert(key.clone(), value.clone());
                }
            }
        }

        // graft join buckets onto the tree; a deep join can only be placed
        // once its parent is, so sweep the pending list until a pass places
        // nothing
        let mut placed: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending: Vec<&JoinLink> = self.joins.iter().collect();
        loop {
            let mut progressed = false;
            pending.retain(|join| {
                let parent_path = if join.local_alias == self.root_alias {
                    Some(Vec::new())
                } else {
                    placed.get(&join.local_alias).cloned()
                };
                let Some(mut path) = parent_path else {
                    return true;
                };
                let bucket = buckets.remove(&join.name).unwrap_or_default();
                if let Some(target) = navigate_mut(&mut root, &path) {
                    target.insert(join.name.clone(), Value::Object(bucket));
                    path.push(join.name.clone());
                    placed.insert(join.name.clone(), path);
                    progressed = true;
                }
                false
            });
            if pending.is_empty() || !progressed {
                break;
            }
        }

        Value::Object(root)
    }

    /// Denormalize a result set. Non-object rows are skipped.
    pub fn denormalize_rows(&self, rows: &[Value]) -> Vec<Value> {
        rows.iter()
            .filter_map(|row| row.as_object().map(|map| self.denormalize(map)))
            .collect()
    }

    /// Decode one flat key into (long table alias, long column key). The
    /// emitted-alias map of the compile pass wins; the `_<t>__<c>` pattern is
    /// the fallback, short segments expanded through the reverse alias maps.
    fn resolve_key(&self, key: &str) -> Option<(String, String)> {
        if let Some((table, column)) = self.emitted.get(key) {
            return Some((table.clone(), column.clone()));
        }
        let trimmed = key.strip_prefix('_')?;
        let (table_short, column_short) = trimmed.split_once("__")?;
        if table_short.is_empty() || column_short.is_empty() {
            return None;
        }
        let table = self
            .tables_rev
            .get(table_short)
            .cloned()
            .unwrap_or_else(|| table_short.to_string());
        let column = self
            .columns_rev
            .get(column_short)
            .cloned()
            .unwrap_or_else(|| column_short.to_string());
        Some((table, column))
    }
}

fn navigate_mut<'a>(
    root: &'a mut Map<String, Value>,
    path: &[String],
) -> Option<&'a mut Map<String, Value>> {
    let mut current = root;
    for segment in path {
        current = current.get_mut(segment)?.as_object_mut()?;
    }
    Some(current)
}
