//! Convenience re-exports for the common query-building surface.

pub use crate::compiler::{
    ColumnSpec, Comparison, ConditionTree, ConditionValue, Glue, JoinColumns, JoinDescriptor,
    JoinType, NullsOrder, QueryCompiler, RowDenormalizer, SortDirection, SortOrder,
};
pub use crate::dialect::{Dialect, PostgresDialect};
pub use crate::errors::{QueryError, QueryResult};
pub use crate::expression::SqlExpression;
