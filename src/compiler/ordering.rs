//! ORDER BY direction parsing and rendering

use crate::errors::{QueryError, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

impl NullsOrder {
    pub fn to_sql(&self) -> &'static str {
        match self {
            NullsOrder::First => "NULLS FIRST",
            NullsOrder::Last => "NULLS LAST",
        }
    }
}

/// Parsed ordering direction: `(asc|desc)( nulls (first|last))?`,
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDirection {
    pub order: SortOrder,
    pub nulls: Option<NullsOrder>,
}

impl SortDirection {
    pub fn asc() -> Self {
        Self {
            order: SortOrder::Asc,
            nulls: None,
        }
    }

    pub fn desc() -> Self {
        Self {
            order: SortOrder::Desc,
            nulls: None,
        }
    }

    pub fn parse(direction: &str) -> QueryResult<Self> {
        let lower = direction.trim().to_ascii_lowercase();
        let tokens: Vec<&str> = lower.split_whitespace().collect();
        let order = match tokens.first() {
            Some(&"asc") => SortOrder::Asc,
            Some(&"desc") => SortOrder::Desc,
            _ => {
                return Err(QueryError::InvalidSpecification(format!(
                    "unrecognized sort direction '{direction}'"
                )));
            }
        };
        let nulls = match tokens.get(1..) {
            None | Some([]) => None,
            Some(["nulls", "first"]) => Some(NullsOrder::First),
            Some(["nulls", "last"]) => Some(NullsOrder::Last),
            _ => {
                return Err(QueryError::InvalidSpecification(format!(
                    "unrecognized sort direction '{direction}'"
                )));
            }
        };
        Ok(Self { order, nulls })
    }

    pub fn to_sql(&self) -> String {
        match self.nulls {
            Some(nulls) => format!("{} {}", self.order.to_sql(), nulls.to_sql()),
            None => self.order.to_sql().to_string(),
        }
    }
}
