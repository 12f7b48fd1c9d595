use thiserror::Error;

/// Errors raised while configuring or compiling a query.
///
/// All variants are raised synchronously during a builder setter or during
/// `compile()`, never during execution: the compiler fails fast before any
/// I/O is attempted. None are retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Invalid join '{name}': {reason}")]
    InvalidJoin { name: String, reason: String },

    #[error("Duplicate join '{0}'")]
    DuplicateJoin(String),

    #[error("Missing join or WITH query for: {0}")]
    MissingJoin(String),

    #[error("No columns selected")]
    NoColumnsSelected,

    #[error("Pagination requires a limit")]
    PaginationWithoutLimit,

    #[error("Unsupported operator '{operator}' for value {value}")]
    UnsupportedOperator { operator: String, value: String },

    #[error("Unconvertible value: {0}")]
    UnconvertibleValue(String),
}

pub type QueryResult<T> = Result<T, QueryError>;
