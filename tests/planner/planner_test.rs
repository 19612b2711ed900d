#[path = "../common/mod.rs"]
mod common;

use common::library_schema;
use graft::alias::AliasRegistry;
use graft::config::EngineSettings;
use graft::planner::{JoinPlanner, QueryRequest};
use graft::{Dialect, Filter, OrderSpec, QueryError, RelationPath, Schema};
use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

fn request(schema: &Schema, root: &str) -> QueryRequest {
    QueryRequest::new(schema.entity_id(root).unwrap())
}

fn paths(raw: &[&str]) -> Vec<RelationPath> {
    raw.iter().map(|p| RelationPath::parse(p)).collect()
}

fn assert_sqlite(sql: &str) {
    if let Err(err) = Parser::parse_sql(&SQLiteDialect {}, sql) {
        panic!("invalid SQL: {err}\n{sql}");
    }
}

#[test]
fn test_foreign_key_join_statement() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Book");
    req.select_related = paths(&["author"]);
    let planned = planner.plan(&req).unwrap();

    insta::assert_snapshot!(planned.statement.sql, @r#"
    SELECT
      "books"."id" AS "id",
      "books"."title" AS "title",
      "books"."author_id" AS "author_id",
      "books"."editor_id" AS "editor_id",
      "a6efd8"."id" AS "a6efd8_id",
      "a6efd8"."name" AS "a6efd8_name",
      "a6efd8"."bio" AS "a6efd8_bio",
      "a6efd8"."publisher_id" AS "a6efd8_publisher_id"
    FROM "books"
    LEFT OUTER JOIN "authors" AS "a6efd8" ON "books"."author_id" = "a6efd8"."id"
    ORDER BY "books"."id" ASC, "a6efd8"."id" ASC
    "#);
    assert!(planned.statement.params.is_empty());
    assert!(!planned.root_paginated);
    assert_sqlite(&planned.statement.sql);
}

#[test]
fn test_aliases_are_stable_across_queries() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.select_related = paths(&["books__tags", "publisher"]);
    let first = planner.plan(&req).unwrap().statement;
    let registered = registry.len();
    let second = planner.plan(&req).unwrap().statement;

    assert_eq!(first, second);
    assert_eq!(registry.len(), registered);

    // A fresh registry mints the same aliases.
    let other = AliasRegistry::default();
    let third = JoinPlanner::new(&schema, &other, &settings)
        .plan(&req)
        .unwrap()
        .statement;
    assert_eq!(first, third);
}

#[test]
fn test_self_reference_gets_path_scoped_alias() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Employee");
    req.select_related = paths(&["supervisor__supervisor"]);
    let sql = planner.plan(&req).unwrap().statement.sql;

    // Edge alias for the first hop, path alias for the second.
    assert!(sql.contains(r#"LEFT OUTER JOIN "employees" AS "64b941" ON "employees"."supervisor_id" = "64b941"."id""#));
    assert!(sql.contains(r#"LEFT OUTER JOIN "employees" AS "391396" ON "64b941"."supervisor_id" = "391396"."id""#));
    assert!(sql.contains(r#""391396"."name" AS "391396_name""#));
    assert_sqlite(&sql);
}

#[test]
fn test_many_to_many_joins_through_table() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Book");
    req.select_related = paths(&["tags"]);
    let sql = planner.plan(&req).unwrap().statement.sql;

    let through = sql.find(r#"LEFT OUTER JOIN "book_tags""#).unwrap();
    let target = sql.find(r#"LEFT OUTER JOIN "tags""#).unwrap();
    assert!(through < target);
    assert!(!sql.contains(r#""book_tags"."tag_id" AS"#));
    assert_sqlite(&sql);
}

#[test]
fn test_filter_infers_join() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.filters.push(Filter::lookup("publisher__name", "Orbit"));
    let planned = planner.plan(&req).unwrap();

    assert!(planned.statement.sql.contains(r#"LEFT OUTER JOIN "publishers""#));
    assert!(planned.tree.contains(&RelationPath::parse("publisher")));
    assert_eq!(planned.statement.params, vec![graft::Value::from("Orbit")]);
}

#[test]
fn test_pagination_rewrites_root_as_derived_table() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.select_related = paths(&["books"]);
    req.filters.push(Filter::lookup("name", "Ann"));
    req.filters.push(Filter::lookup("books__title", "Ash"));
    req.limit = Some(2);
    req.offset = Some(4);
    let planned = planner.plan(&req).unwrap();
    let sql = &planned.statement.sql;

    assert!(planned.root_paginated);
    assert!(sql.contains("FROM (SELECT"));
    assert!(sql.contains(r#") AS "authors""#));
    assert!(sql.contains(r#""authors"."id" IN (SELECT"#));
    // Pagination applies once, inside the derived table.
    assert_eq!(sql.matches("LIMIT 2").count(), 1);
    assert!(sql.trim_end().ends_with("ASC"));
    // Root filter and relation filter in the page, relation filter again outside.
    assert_eq!(planned.statement.params.len(), 3);
    assert_sqlite(sql);
}

#[test]
fn test_pagination_with_key_semi_join() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let mut settings = EngineSettings::default();
    settings.pagination.subquery = false;
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.select_related = paths(&["books"]);
    req.order_by.push(OrderSpec::desc("name"));
    req.limit = Some(10);
    let sql = planner.plan(&req).unwrap().statement.sql;

    assert!(sql.contains(r#"FROM "authors""#));
    assert!(sql.contains(r#"SELECT
  "__page"."id""#));
    assert!(sql.contains(r#") AS "__page""#));
    assert!(sql.contains(r#"ORDER BY "authors"."name" DESC, "authors"."id" ASC"#));
    assert_sqlite(&sql);
}

#[test]
fn test_pagination_orders_page_by_related_column() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Book");
    req.select_related = paths(&["author"]);
    req.order_by.push(OrderSpec::desc("author__name"));
    req.limit = Some(1);
    let sql = planner.plan(&req).unwrap().statement.sql;

    let page = &sql[sql.find("FROM (SELECT").unwrap()..sql.find(r#") AS "books""#).unwrap()];
    assert!(page.contains(r#"LEFT OUTER JOIN "authors" AS "a6efd8""#));
    assert!(page.contains(
        r#"GROUP BY "books"."id", "books"."title", "books"."author_id", "books"."editor_id""#
    ));
    assert!(page.contains(r#"ORDER BY MAX("a6efd8"."name") DESC, "books"."id" ASC"#));
    assert!(sql.contains(r#"ORDER BY "a6efd8"."name" DESC, "books"."id" ASC"#));
    assert_sqlite(&sql);

    req.order_by = vec![OrderSpec::asc("author__name")];
    let sql = planner.plan(&req).unwrap().statement.sql;
    assert!(sql.contains(r#"ORDER BY MIN("a6efd8"."name") ASC"#));
}

#[test]
fn test_limit_without_joins_stays_plain() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.limit = Some(5);
    let planned = planner.plan(&req).unwrap();
    assert!(!planned.root_paginated);
    assert!(planned.statement.sql.trim_end().ends_with("LIMIT 5"));
}

#[test]
fn test_count_statement() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default().with_dialect(Dialect::Postgres);
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.filters.push(Filter::lookup("books__title__startswith", "A"));
    req.limit = Some(1);
    let stmt = planner.plan_count(&req).unwrap();

    assert!(stmt
        .sql
        .starts_with("SELECT\n  COUNT(DISTINCT \"authors\".\"id\") AS \"count\""));
    assert!(!stmt.sql.contains("LIMIT"));
    assert!(stmt.sql.contains("$1"));
    assert_eq!(stmt.params, vec![graft::Value::from("A%")]);
    Parser::parse_sql(&PostgreSqlDialect {}, &stmt.sql.replace(" ESCAPE '\\'", "")).unwrap();
}

#[test]
fn test_resolution_errors() {
    let schema = library_schema();
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let planner = JoinPlanner::new(&schema, &registry, &settings);

    let mut req = request(&schema, "Author");
    req.select_related = paths(&["books__missing"]);
    assert!(matches!(
        planner.plan(&req),
        Err(QueryError::UnknownRelation { ref segment, .. }) if segment == "missing"
    ));

    let mut req = request(&schema, "Author");
    req.filters.push(Filter::lookup("nickname", "x"));
    assert!(matches!(planner.plan(&req), Err(QueryError::UnknownField { .. })));

    let mut req = request(&schema, "Author");
    req.filters.push(Filter::lookup("name__sounds_like", "x"));
    assert!(matches!(planner.plan(&req), Err(QueryError::UnknownOperator { .. })));

    let mut req = request(&schema, "Author");
    req.filters.push(Filter::lookup("name__in", "x"));
    assert!(matches!(planner.plan(&req), Err(QueryError::InvalidLookupValue { .. })));
}
