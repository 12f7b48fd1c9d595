//! # Queryhaus
//!
//! A fluent SQL query compiler and result-row denormalizer for
//! PostgreSQL-flavored databases.
//!
//! The compiler turns a declarative query description (columns, joins,
//! condition trees, grouping, ordering, paging, WITH queries) into a
//! dialect-correct SQL string. Every identifier and value that reaches the
//! SQL text goes through a [`Dialect`](dialect::Dialect) implementation, so
//! quoting and escaping live in exactly one place. After execution, the
//! [`RowDenormalizer`](compiler::RowDenormalizer) converts each flat result
//! row back into a nested record keyed by table and join name, using the same
//! alias state that produced the SQL.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use queryhaus::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> Result<(), QueryError> {
//!     let mut query = QueryCompiler::new(Arc::new(PostgresDialect), "users", "Users")
//!         .columns(["id", "name"])
//!         .join(
//!             JoinDescriptor::new("Orders", JoinType::Left, "Users", "id", "orders", "user_id")
//!                 .with_columns(JoinColumns::list(["total"])),
//!         )?
//!         .filter(ConditionTree::new().push("status", json!("active")))
//!         .order_by("name", "asc")?
//!         .limit(25);
//!
//!     let sql = query.compile()?;
//!     assert!(sql.starts_with("SELECT"));
//!
//!     // Rows returned by the execution layer are flat; the denormalizer
//!     // rebuilds one nested record per row.
//!     let denormalizer = query.denormalizer();
//!     Ok(())
//! }
//! ```

/// Conditional debug logging macros
/// These macros only compile in code when the `debug-logging` feature is enabled
#[cfg(feature = "debug-logging")]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "debug-logging"))]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "debug-logging")]
#[macro_export]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "debug-logging"))]
#[macro_export]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

pub mod compiler;
pub mod dialect;
pub mod errors;
pub mod expression;
pub mod prelude;

// Re-export the main public types for convenience
pub use compiler::{
    ColumnSpec, ConditionTree, ConditionValue, JoinColumns, JoinDescriptor, JoinType,
    QueryCompiler, RowDenormalizer, SortDirection,
};
pub use dialect::{Dialect, PostgresDialect};
pub use errors::{QueryError, QueryResult};
pub use expression::SqlExpression;

// Re-export external dependencies used in the public API
pub use serde_json;
