//! Query compilation pipeline
//!
//! The compiler turns builder state into SQL text and keeps the alias maps
//! needed to reverse the flat result rows back into nested records.

pub mod alias;
pub mod builder;
pub mod column;
pub mod condition;
pub mod denormalize;
pub mod join;
pub mod ordering;

#[cfg(test)]
mod tests;

pub use alias::AliasRegistry;
pub use builder::QueryCompiler;
pub use column::{ColumnDescriptor, ColumnName, ColumnSpec};
pub use condition::{Comparison, ConditionTree, ConditionValue, Glue};
pub use denormalize::RowDenormalizer;
pub use join::{JoinColumns, JoinDescriptor, JoinType};
pub use ordering::{NullsOrder, SortDirection, SortOrder};
