//! Identifier alias registry
//!
//! Maps long or collision-prone table/join aliases and column keys to safe
//! short identifiers and back. The registry is rebuilt at the start of every
//! compile pass; within one pass a mapping, once assigned, never changes.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{QueryError, QueryResult};

/// Longest alias emitted as-is. Anything longer gets a synthetic token so the
/// `_<table>__<column>` select aliases stay inside engine identifier limits.
const MAX_PLAIN_ALIAS: usize = 16;

/// Retry budget when a synthetic token collides with an assigned one.
const SHORTEN_ATTEMPTS: usize = 64;

#[derive(Debug, Clone)]
pub struct AliasRegistry {
    tables: HashMap<String, String>,
    tables_rev: HashMap<String, String>,
    columns: HashMap<String, String>,
    columns_rev: HashMap<String, String>,
    rng: StdRng,
}

impl AliasRegistry {
    /// A seeded registry produces the same synthetic tokens on every pass;
    /// without a seed the salt characters come from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            tables: HashMap::new(),
            tables_rev: HashMap::new(),
            columns: HashMap::new(),
            columns_rev: HashMap::new(),
            rng,
        }
    }

    /// Short alias for a table/join alias, stable for this registry's
    /// lifetime.
    pub fn shorten(&mut self, long: &str) -> QueryResult<String> {
        assign(&mut self.tables, &mut self.tables_rev, &mut self.rng, long)
    }

    /// Short alias for a column key.
    pub fn column_alias(&mut self, long: &str) -> QueryResult<String> {
        assign(
            &mut self.columns,
            &mut self.columns_rev,
            &mut self.rng,
            long,
        )
    }

    /// Long table/join alias for a short one.
    pub fn expand(&self, short: &str) -> Option<&str> {
        self.tables_rev.get(short).map(String::as_str)
    }

    /// Long column key for a short one.
    pub fn expand_column(&self, short: &str) -> Option<&str> {
        self.columns_rev.get(short).map(String::as_str)
    }

    /// True when `candidate` is `long` itself or a short alias assigned to it.
    pub fn resolves_to(&self, candidate: &str, long: &str) -> bool {
        candidate == long || self.expand(candidate).is_some_and(|l| l == long)
    }

    pub(crate) fn reverse_table_map(&self) -> HashMap<String, String> {
        self.tables_rev.clone()
    }

    pub(crate) fn reverse_column_map(&self) -> HashMap<String, String> {
        self.columns_rev.clone()
    }
}

fn assign(
    forward: &mut HashMap<String, String>,
    reverse: &mut HashMap<String, String>,
    rng: &mut StdRng,
    long: &str,
) -> QueryResult<String> {
    if let Some(short) = forward.get(long) {
        return Ok(short.clone());
    }

    let short = if long.len() <= MAX_PLAIN_ALIAS {
        // A plain alias can still clash with an already-assigned synthetic
        // token; that clash is a hard error rather than a silent remap.
        if let Some(existing) = reverse.get(long)
            && existing != long
        {
            return Err(QueryError::InvalidSpecification(format!(
                "alias '{long}' collides with the short alias assigned to '{existing}'"
            )));
        }
        long.to_string()
    } else {
        synthetic_token(reverse, rng, long)?
    };

    reverse.insert(short.clone(), long.to_string());
    forward.insert(long.to_string(), short.clone());
    Ok(short)
}

/// 9-character token: one random lowercase letter, 7 hex digits of the CRC32
/// of the long alias, one random digit. The random salt is retried on
/// collision and the assignment rejected once the budget is exhausted.
fn synthetic_token(
    reverse: &HashMap<String, String>,
    rng: &mut StdRng,
    long: &str,
) -> QueryResult<String> {
    let crc = crc32fast::hash(long.as_bytes()) & 0x0FFF_FFFF;
    for _ in 0..SHORTEN_ATTEMPTS {
        let letter = (b'a' + rng.random_range(0..26u8)) as char;
        let digit = (b'0' + rng.random_range(0..10u8)) as char;
        let candidate = format!("{letter}{crc:07x}{digit}");
        if !reverse.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(QueryError::InvalidSpecification(format!(
        "could not assign a collision-free short alias for '{long}'"
    )))
}
