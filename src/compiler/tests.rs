//! Compiler integration tests: full builder-to-SQL passes and the
//! denormalizer fed from real compile output.

use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::dialect::PostgresDialect;
use crate::errors::QueryError;

fn compiler(table: &str, alias: &str) -> QueryCompiler {
    QueryCompiler::new(Arc::new(PostgresDialect), table, alias).with_alias_seed(1)
}

fn orders_join() -> JoinDescriptor {
    JoinDescriptor::new("Orders", JoinType::Left, "Users", "id", "orders", "user_id")
}

// ===== basic compilation =====

#[test]
fn test_basic_select() {
    let mut query = compiler("users", "Users").columns(["id", "name"]);
    assert_eq!(
        query.compile().unwrap(),
        "SELECT \"Users\".\"id\" AS \"_Users__id\", \"Users\".\"name\" AS \"_Users__name\" \
         FROM \"users\" AS \"Users\""
    );
}

#[test]
fn test_no_columns_is_an_error() {
    let mut query = compiler("users", "Users");
    assert_eq!(query.compile().unwrap_err(), QueryError::NoColumnsSelected);
}

#[test]
fn test_schema_qualified_from() {
    let mut query = compiler("users", "Users").with_schema("crm").columns(["id"]);
    assert!(
        query
            .compile()
            .unwrap()
            .contains("FROM \"crm\".\"users\" AS \"Users\"")
    );
}

#[test]
fn test_root_columns_are_unprefixed_in_where() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .filter(ConditionTree::new().push("status", json!("active")));
    assert_eq!(
        query.compile().unwrap(),
        "SELECT \"Users\".\"id\" AS \"_Users__id\" FROM \"users\" AS \"Users\" \
         WHERE \"status\" = 'active'"
    );
}

#[test]
fn test_compile_is_repeatable() {
    let mut query = compiler("users", "Users")
        .columns(["id", "name"])
        .filter(ConditionTree::new().push("age >=", json!(18)));
    let first = query.compile().unwrap();
    let second = query.compile().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_unchanged_query_reuses_the_previous_pass() {
    // no seed: a recompile would re-salt the synthetic alias, so identical
    // SQL shows the second call served the cached pass
    let mut query = QueryCompiler::new(Arc::new(PostgresDialect), "users", "Users")
        .columns(["id"])
        .join(
            JoinDescriptor::new(
                "CustomerOrderHistory",
                JoinType::Left,
                "Users",
                "id",
                "order_history",
                "user_id",
            )
            .with_columns(JoinColumns::list(["total"])),
        )
        .unwrap();
    let first = query.compile().unwrap();
    let second = query.compile().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_setters_invalidate_the_cached_pass() {
    let mut query = compiler("users", "Users").columns(["id"]);
    let first = query.compile().unwrap();
    let mut query = query.limit(5);
    let second = query.compile().unwrap();
    assert_ne!(first, second);
    assert!(second.ends_with("LIMIT 5"));
}

// ===== joins =====

#[test]
fn test_join_with_column_list() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(orders_join().with_columns(JoinColumns::list(["total"])))
        .unwrap();
    assert_eq!(
        query.compile().unwrap(),
        "SELECT \"Users\".\"id\" AS \"_Users__id\", \"Orders\".\"total\" AS \"_Orders__total\" \
         FROM \"users\" AS \"Users\" \
         LEFT JOIN \"orders\" AS \"Orders\" ON (\"Users\".\"id\" = \"Orders\".\"user_id\")"
    );
}

#[test]
fn test_join_defaults_to_all_columns() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(orders_join())
        .unwrap();
    assert!(query.compile().unwrap().contains(", \"Orders\".*"));
}

#[test]
fn test_inline_join_column_list_overrides_the_join() {
    let mut query = compiler("users", "Users")
        .columns(vec![
            ColumnSpec::from("id"),
            ColumnSpec::Join {
                name: "Orders".to_string(),
                columns: vec![ColumnSpec::from("total")],
            },
        ])
        .join(orders_join())
        .unwrap();
    let sql = query.compile().unwrap();
    assert!(sql.contains("\"Orders\".\"total\" AS \"_Orders__total\""));
    assert!(!sql.contains("\"Orders\".*"));
}

#[test]
fn test_duplicate_join_is_rejected() {
    let err = compiler("users", "Users")
        .join(orders_join())
        .unwrap()
        .join(orders_join())
        .unwrap_err();
    assert_eq!(err, QueryError::DuplicateJoin("Orders".to_string()));
}

#[test]
fn test_join_name_must_be_pascal_case() {
    let err = compiler("users", "Users")
        .join(JoinDescriptor::new(
            "orders",
            JoinType::Left,
            "Users",
            "id",
            "orders",
            "user_id",
        ))
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidJoin { .. }));
}

#[test]
fn test_column_referencing_unregistered_join_fails() {
    let mut query = compiler("users", "Users").columns(["id", "Orders.total"]);
    assert_eq!(
        query.compile().unwrap_err(),
        QueryError::MissingJoin("Orders".to_string())
    );
}

#[test]
fn test_filter_referencing_unregistered_join_fails() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .filter(ConditionTree::new().push("Orders.total >", json!(100)));
    assert_eq!(
        query.compile().unwrap_err(),
        QueryError::MissingJoin("Orders".to_string())
    );
}

#[test]
fn test_ordering_referencing_unregistered_join_fails() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .order_by("Orders.total", "desc")
        .unwrap();
    assert_eq!(
        query.compile().unwrap_err(),
        QueryError::MissingJoin("Orders".to_string())
    );
}

#[test]
fn test_deep_join_requires_its_parent() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(JoinDescriptor::new(
            "Items",
            JoinType::Left,
            "Orders",
            "id",
            "order_items",
            "order_id",
        ))
        .unwrap();
    assert_eq!(
        query.compile().unwrap_err(),
        QueryError::MissingJoin("Orders".to_string())
    );
}

// ===== count / exists =====

#[test]
fn test_count_drops_unused_left_joins() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(orders_join().with_columns(JoinColumns::None))
        .unwrap();
    assert_eq!(
        query.compile_count(true).unwrap(),
        "SELECT COUNT(*) FROM \"users\" AS \"Users\""
    );
    assert!(query.compile_count(false).unwrap().contains("LEFT JOIN"));
}

#[test]
fn test_count_keeps_left_joins_used_by_filters() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(orders_join().with_columns(JoinColumns::None))
        .unwrap()
        .filter(ConditionTree::new().push("Orders.total >", json!(100)));
    assert_eq!(
        query.compile_count(true).unwrap(),
        "SELECT COUNT(*) FROM \"users\" AS \"Users\" \
         LEFT JOIN \"orders\" AS \"Orders\" ON (\"Users\".\"id\" = \"Orders\".\"user_id\") \
         WHERE \"Orders\".\"total\" > 100"
    );
}

#[test]
fn test_count_keeps_the_parent_chain_of_a_filtered_deep_join() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(orders_join().with_columns(JoinColumns::None))
        .unwrap()
        .join(
            JoinDescriptor::new("Items", JoinType::Left, "Orders", "id", "order_items", "order_id")
                .with_columns(JoinColumns::None),
        )
        .unwrap()
        .filter(ConditionTree::new().push("Items.sku", json!("A-1")));
    // only Items appears in the WHERE, but its ON clause rides on Orders
    assert_eq!(
        query.compile_count(true).unwrap(),
        "SELECT COUNT(*) FROM \"users\" AS \"Users\" \
         LEFT JOIN \"orders\" AS \"Orders\" ON (\"Users\".\"id\" = \"Orders\".\"user_id\") \
         LEFT JOIN \"order_items\" AS \"Items\" ON (\"Orders\".\"id\" = \"Items\".\"order_id\") \
         WHERE \"Items\".\"sku\" = 'A-1'"
    );
}

#[test]
fn test_exists_selects_one_with_limit_one() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .filter(ConditionTree::new().push("status", json!("active")));
    assert_eq!(
        query.compile_exists(false).unwrap(),
        "SELECT 1 FROM \"users\" AS \"Users\" WHERE \"status\" = 'active' LIMIT 1"
    );
}

// ===== grouping, ordering, paging =====

#[test]
fn test_group_by_and_having() {
    let mut query = compiler("users", "Users")
        .columns(["role"])
        .group_by(["role"])
        .having(ConditionTree::new().raw("count(*) > 3"));
    assert_eq!(
        query.compile().unwrap(),
        "SELECT \"Users\".\"role\" AS \"_Users__role\" FROM \"users\" AS \"Users\" \
         GROUP BY \"role\" HAVING count(*) > 3"
    );
}

#[test]
fn test_order_limit_offset() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .order_by("name", "desc nulls last")
        .unwrap()
        .limit(10)
        .offset(20);
    assert!(
        query
            .compile()
            .unwrap()
            .ends_with("ORDER BY \"name\" DESC NULLS LAST LIMIT 10 OFFSET 20")
    );
}

#[test]
fn test_ordering_twice_on_a_column_replaces_the_direction() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .order_by("name", "asc")
        .unwrap()
        .order_by("name", "desc")
        .unwrap();
    let sql = query.compile().unwrap();
    assert!(sql.ends_with("ORDER BY \"name\" DESC"));
    assert!(!sql.contains("ASC"));
}

#[test]
fn test_count_omits_ordering_and_paging() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .order_by("name", "asc")
        .unwrap()
        .limit(10)
        .offset(20);
    let sql = query.compile_count(false).unwrap();
    assert!(!sql.contains("ORDER BY"));
    assert!(!sql.contains("LIMIT"));
    assert!(!sql.contains("OFFSET"));
}

#[test]
fn test_page_navigation_moves_the_offset() {
    let query = compiler("users", "Users").columns(["id"]).limit(10);
    let mut query = query.fetch_next_page().unwrap().fetch_next_page().unwrap();
    assert!(query.compile().unwrap().ends_with("LIMIT 10 OFFSET 20"));

    let mut query = query.clone().fetch_prev_page().unwrap();
    assert!(query.compile().unwrap().ends_with("LIMIT 10 OFFSET 10"));
}

#[test]
fn test_prev_page_stops_at_zero() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .limit(10)
        .fetch_prev_page()
        .unwrap();
    assert!(query.compile().unwrap().ends_with("LIMIT 10 OFFSET 0"));
}

#[test]
fn test_pagination_requires_a_limit() {
    let err = compiler("users", "Users")
        .columns(["id"])
        .fetch_next_page()
        .unwrap_err();
    assert_eq!(err, QueryError::PaginationWithoutLimit);
}

// ===== distinct =====

#[test]
fn test_distinct() {
    let mut query = compiler("users", "Users").columns(["id"]).distinct(true);
    assert!(query.compile().unwrap().starts_with("SELECT DISTINCT \"Users\""));
}

#[test]
fn test_distinct_on() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .distinct_on(["role"]);
    assert!(
        query
            .compile()
            .unwrap()
            .starts_with("SELECT DISTINCT ON (\"role\") ")
    );
}

// ===== filters =====

#[test]
fn test_and_filter_appends() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .filter(ConditionTree::new().push("status", json!("active")))
        .and_filter(ConditionTree::new().push("age >=", json!(18)));
    assert!(
        query
            .compile()
            .unwrap()
            .ends_with("WHERE \"status\" = 'active' AND \"age\" >= 18")
    );
}

#[test]
fn test_subquery_condition_compiles_inline() {
    let subquery = compiler("orders", "Orders").columns(["user_id"]);
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .filter(ConditionTree::new().push("id", subquery));
    assert!(query.compile().unwrap().ends_with(
        "WHERE \"id\" IN (SELECT \"Orders\".\"user_id\" AS \"_Orders__user_id\" \
         FROM \"orders\" AS \"Orders\")"
    ));
}

// ===== WITH queries =====

#[test]
fn test_with_query_renders_first() {
    let totals = compiler("orders", "Orders").columns(["user_id"]);
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .with(totals, "Totals")
        .unwrap();
    assert_eq!(
        query.compile().unwrap(),
        "WITH \"Totals\" AS (SELECT \"Orders\".\"user_id\" AS \"_Orders__user_id\" \
         FROM \"orders\" AS \"Orders\") \
         SELECT \"Users\".\"id\" AS \"_Users__id\" FROM \"users\" AS \"Users\""
    );
}

#[test]
fn test_nested_with_queries_flatten_dependencies_first() {
    let inner = compiler("audit", "Audit").columns(["id"]);
    let totals = compiler("orders", "Orders")
        .columns(["user_id"])
        .with(inner, "Inner")
        .unwrap();
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .with(totals, "Totals")
        .unwrap();
    let sql = query.compile().unwrap();
    assert!(sql.starts_with("WITH \"Inner\" AS ("));
    assert!(sql.contains("), \"Totals\" AS ("));
    // the flattened body carries no nested WITH of its own
    assert_eq!(sql.matches("WITH ").count(), 1);
}

#[test]
fn test_with_query_alias_cycle_is_rejected() {
    let inner = compiler("audit", "Audit").columns(["id"]);
    let middle = compiler("orders", "Orders")
        .columns(["id"])
        .with(inner, "Totals")
        .unwrap();
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .with(middle, "Totals")
        .unwrap();
    assert!(matches!(
        query.compile().unwrap_err(),
        QueryError::InvalidSpecification(_)
    ));
}

#[test]
fn test_with_alias_must_be_an_identifier() {
    let body = compiler("orders", "Orders").columns(["id"]);
    let err = compiler("users", "Users").with(body, "no spaces").unwrap_err();
    assert!(matches!(err, QueryError::InvalidSpecification(_)));
}

// ===== alias shortening and denormalization =====

#[test]
fn test_long_join_alias_is_shortened_to_synthetic_token() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(
            JoinDescriptor::new(
                "CustomerOrderHistory",
                JoinType::Left,
                "Users",
                "id",
                "order_history",
                "user_id",
            )
            .with_columns(JoinColumns::list(["total"])),
        )
        .unwrap();
    let sql = query.compile().unwrap();
    let crc = crc32fast::hash(b"CustomerOrderHistory") & 0x0FFF_FFFF;
    assert!(sql.contains(&format!("{crc:07x}")));
    assert!(!sql.contains("\"CustomerOrderHistory\""));
}

#[test]
fn test_denormalizer_round_trips_shortened_aliases() {
    let mut query = compiler("users", "Users")
        .columns(["id"])
        .join(
            JoinDescriptor::new(
                "CustomerOrderHistory",
                JoinType::Left,
                "Users",
                "id",
                "order_history",
                "user_id",
            )
            .with_columns(JoinColumns::list(["total"])),
        )
        .unwrap();
    let sql = query.compile().unwrap();

    // fish the flat select alias out of the compiled SQL
    let flat = sql
        .split('"')
        .find(|part| part.starts_with('_') && part.ends_with("__total"))
        .unwrap()
        .to_string();

    let mut row = serde_json::Map::new();
    row.insert("_Users__id".to_string(), json!(1));
    row.insert(flat, json!(50));
    assert_eq!(
        query.denormalizer().denormalize(&row),
        json!({"id": 1, "CustomerOrderHistory": {"total": 50}})
    );
}

#[test]
fn test_denormalizer_matches_compiled_select_list() {
    let mut query = compiler("users", "Users")
        .columns(["id", "name"])
        .join(orders_join().with_columns(JoinColumns::list(["total"])))
        .unwrap();
    query.compile().unwrap();

    let rows = vec![json!({
        "_Users__id": 1,
        "_Users__name": "Ada",
        "_Orders__total": 50
    })];
    assert_eq!(
        query.denormalizer().denormalize_rows(&rows),
        vec![json!({"id": 1, "name": "Ada", "Orders": {"total": 50}})]
    );
}

// ===== sub-query embedding =====

#[test]
fn test_compile_as_subquery_is_parenthesized() {
    let mut query = compiler("users", "Users").columns(["id"]);
    let sql = query.compile_as_subquery().unwrap();
    assert!(sql.starts_with("(SELECT "));
    assert!(sql.ends_with(')'));
}
