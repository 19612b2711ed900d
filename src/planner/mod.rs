//! Join planning.
//!
//! A [`QueryRequest`] goes in; a [`PlannedQuery`] comes out, holding the
//! compiled statement and the [`JoinTree`] the materializer slices rows with.
//!
//! Phases:
//! 1. Resolve projections, requested paths, filters and orderings; paths read
//!    by filters or orderings are joined implicitly.
//! 2. Expand the join set to every implied prefix and assign aliases.
//! 3. Emit SQL. With joins and limit/offset together, the root is paginated
//!    before the joins fan it out.

mod join;

pub use join::{JoinNode, JoinSet, JoinTree, SelectedColumn};

use std::fmt;

use crate::alias::{AliasPlan, AliasRegistry};
use crate::config::EngineSettings;
use crate::error::QueryResult;
use crate::excludable::{ExcludableSet, FieldSelection};
use crate::filter::{BoundFilter, BoundOrder, Filter, OrderBuilder, Predicate, PredicateBuilder};
use crate::path::{OrderSpec, RelationPath, ResolvedPath, Resolver};
use crate::schema::{EntityId, Schema};
use crate::sql::{
    and_all, count_distinct, max, min, table_col, Dialect, Expr, ExprExt, Join, OrderByExpr,
    Query, SelectExpr, TableRef,
};
use crate::value::Value;

/// Alias of the derived table holding paginated root keys.
const PAGE_ALIAS: &str = "__page";

/// Everything one query asks for.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub root: EntityId,
    /// ANDed together.
    pub filters: Vec<Filter>,
    /// Paths loaded through joins in the main statement.
    pub select_related: Vec<RelationPath>,
    /// Paths loaded through follow-up statements.
    pub prefetch_related: Vec<RelationPath>,
    pub fields: Vec<FieldSelection>,
    pub exclude_fields: Vec<FieldSelection>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Apply limit/offset to raw joined rows instead of root entities.
    pub limit_raw_sql: bool,
    /// Joined paths whose projection is intentionally incomplete.
    pub(crate) partial_paths: Vec<RelationPath>,
    /// Fields that must be selected whatever the projection says.
    pub(crate) required: Vec<(RelationPath, String)>,
    /// Projection to start from before `fields` and `exclude_fields` apply.
    pub(crate) projection: Option<ExcludableSet>,
}

impl QueryRequest {
    pub fn new(root: EntityId) -> Self {
        Self {
            root,
            filters: Vec::new(),
            select_related: Vec::new(),
            prefetch_related: Vec::new(),
            fields: Vec::new(),
            exclude_fields: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            limit_raw_sql: false,
            partial_paths: Vec::new(),
            required: Vec::new(),
            projection: None,
        }
    }

    fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl CompiledStatement {
    pub fn from_query(query: &Query, dialect: Dialect) -> Self {
        let (sql, params) = query.to_tokens_for_dialect(dialect).build(dialect);
        Self { sql, params }
    }
}

impl fmt::Display for CompiledStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Output of [`JoinPlanner::plan`].
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub statement: CompiledStatement,
    pub tree: JoinTree,
    /// Projection the statement was built with.
    pub excludable: ExcludableSet,
    /// True if the root was paginated ahead of the joins.
    pub root_paginated: bool,
}

struct Prepared {
    excludable: ExcludableSet,
    filters: Vec<BoundFilter>,
    orders: Vec<BoundOrder>,
    resolved: Vec<ResolvedPath>,
    aliases: AliasPlan,
}

/// Compiles requests into join statements.
pub struct JoinPlanner<'a> {
    schema: &'a Schema,
    registry: &'a AliasRegistry,
    settings: &'a EngineSettings,
}

impl<'a> JoinPlanner<'a> {
    pub fn new(
        schema: &'a Schema,
        registry: &'a AliasRegistry,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            schema,
            registry,
            settings,
        }
    }

    /// Compile the main statement of `request`.
    pub fn plan(&self, request: &QueryRequest) -> QueryResult<PlannedQuery> {
        let prepared = self.prepare(request)?;
        let root_ty = self.schema.entity(request.root);
        let root_table = root_ty.table.as_str();

        let tree = JoinTree::build(
            self.schema,
            request.root,
            &prepared.resolved,
            &prepared.aliases,
            &prepared.excludable,
            &request.partial_paths,
        )?;
        let joins = self.joins(&prepared, root_table)?;
        let predicates = self.predicates(&prepared, root_table)?;
        let order_by = self.order_by(&prepared, request.root)?;

        let paginate_root =
            request.is_paginated() && !prepared.resolved.is_empty() && !request.limit_raw_sql;

        let mut query = Query::new().select(tree.select_list(root_table));
        query.joins = joins.clone();
        query.order_by = order_by;

        if !paginate_root {
            query = query.from(TableRef::new(root_table));
            query.where_clause = and_all(predicates.into_iter().map(|p| p.expr).collect());
            if let Some(limit) = request.limit {
                query = query.limit(limit);
            }
            if let Some(offset) = request.offset {
                query = query.offset(offset);
            }
        } else if self.settings.pagination.subquery {
            tracing::trace!(root = %root_ty.name, "paginating root in a derived table");
            let columns = root_ty
                .columns
                .iter()
                .map(|c| SelectExpr::new(table_col(root_table, &c.db_name)))
                .collect::<Vec<_>>();
            let page = self.root_page(&prepared, request, &predicates, &joins, columns)?;
            query = query.from(TableRef::derived(page, root_table));
            query.where_clause = and_all(
                predicates
                    .into_iter()
                    .filter(|p| !p.root_only)
                    .map(|p| p.expr)
                    .collect(),
            );
        } else {
            tracing::trace!(root = %root_ty.name, "paginating root through a key semi-join");
            let pk = &root_ty.pk_column().db_name;
            let page = self.root_page(
                &prepared,
                request,
                &predicates,
                &joins,
                vec![SelectExpr::new(table_col(root_table, pk))],
            )?;
            let page_keys = Query::new()
                .select(vec![table_col(PAGE_ALIAS, pk)])
                .from(TableRef::derived(page, PAGE_ALIAS));
            let mut conds: Vec<Expr> = predicates.into_iter().map(|p| p.expr).collect();
            conds.push(table_col(root_table, pk).in_subquery(page_keys));
            query = query.from(TableRef::new(root_table));
            query.where_clause = and_all(conds);
        }

        Ok(PlannedQuery {
            statement: CompiledStatement::from_query(&query, self.settings.dialect),
            tree,
            excludable: prepared.excludable,
            root_paginated: paginate_root,
        })
    }

    /// `COUNT(DISTINCT root.pk)` over the same joins and filters, ignoring
    /// pagination.
    pub fn plan_count(&self, request: &QueryRequest) -> QueryResult<CompiledStatement> {
        let prepared = self.prepare(request)?;
        let root_ty = self.schema.entity(request.root);
        let root_table = root_ty.table.as_str();
        let pk = table_col(root_table, &root_ty.pk_column().db_name);

        let mut query = Query::new()
            .select(vec![count_distinct(pk).alias("count")])
            .from(TableRef::new(root_table));
        query.joins = self.joins(&prepared, root_table)?;
        query.where_clause = and_all(
            self.predicates(&prepared, root_table)?
                .into_iter()
                .map(|p| p.expr)
                .collect(),
        );
        Ok(CompiledStatement::from_query(&query, self.settings.dialect))
    }

    fn prepare(&self, request: &QueryRequest) -> QueryResult<Prepared> {
        let schema = self.schema;
        let root_ty = schema.entity(request.root);
        let resolver = Resolver::new(schema, request.root);

        let mut excludable = request.projection.clone().unwrap_or_default();
        for selection in &request.fields {
            excludable.build(schema, request.root, selection, false)?;
        }
        for selection in &request.exclude_fields {
            excludable.build(schema, request.root, selection, true)?;
        }
        for (path, field) in &request.required {
            excludable.require(path, field);
        }

        let mut join_set = JoinSet::new();
        for path in &request.select_related {
            resolver.resolve(path)?;
            if excludable.excludes_path(path) {
                tracing::trace!(path = %path, "relation excluded, not joined");
                continue;
            }
            join_set.add(path.clone());
        }

        let predicate_builder = PredicateBuilder::new(resolver);
        let filters = request
            .filters
            .iter()
            .map(|f| predicate_builder.bind(f))
            .collect::<QueryResult<Vec<_>>>()?;
        for path in filters.iter().flat_map(BoundFilter::paths) {
            let shown = path.to_string();
            if join_set.add(path) {
                tracing::trace!(path = %shown, "join inferred from filter");
            }
        }

        let order_builder = OrderBuilder::new(resolver);
        let orders = request
            .order_by
            .iter()
            .map(|o| order_builder.bind(o))
            .collect::<QueryResult<Vec<_>>>()?;
        for order in &orders {
            if join_set.add(order.path.clone()) {
                tracing::trace!(path = %order.path, "join inferred from ordering");
            }
        }

        let resolved = join_set
            .expanded()
            .iter()
            .map(|p| resolver.resolve(p))
            .collect::<QueryResult<Vec<_>>>()?;
        let aliases = AliasPlan::assign(self.registry, schema, &root_ty.table, &resolved)?;

        let loaded = resolved
            .iter()
            .filter(|rp| {
                !excludable.excludes_path(&rp.path) && !request.partial_paths.contains(&rp.path)
            })
            .map(|rp| (&rp.path, rp.target));
        excludable.check_required(schema, request.root, loaded)?;

        Ok(Prepared {
            excludable,
            filters,
            orders,
            resolved,
            aliases,
        })
    }

    fn joins(&self, prepared: &Prepared, root_table: &str) -> QueryResult<Vec<Join>> {
        let mut out = Vec::new();
        for resolved in &prepared.resolved {
            out.extend(join::join_clauses(
                self.schema,
                resolved,
                &prepared.aliases,
                root_table,
            )?);
        }
        Ok(out)
    }

    fn predicates(&self, prepared: &Prepared, root_table: &str) -> QueryResult<Vec<Predicate>> {
        prepared
            .filters
            .iter()
            .map(|f| f.compile(&prepared.aliases, root_table))
            .collect()
    }

    /// User orderings, then the root key, then each join target's key.
    fn order_by(&self, prepared: &Prepared, root: EntityId) -> QueryResult<Vec<OrderByExpr>> {
        let root_ty = self.schema.entity(root);
        let root_table = root_ty.table.as_str();
        let mut out = prepared
            .orders
            .iter()
            .map(|o| o.compile(&prepared.aliases, root_table))
            .collect::<QueryResult<Vec<_>>>()?;

        push_tie_break(
            &mut out,
            table_col(root_table, &root_ty.pk_column().db_name),
        );
        for resolved in &prepared.resolved {
            let alias = prepared.aliases.qualifier(&resolved.path, root_table)?;
            let target = self.schema.entity(resolved.target);
            push_tie_break(&mut out, table_col(alias, &target.pk_column().db_name));
        }
        Ok(out)
    }

    /// Root rows of the requested page, before any fan-out.
    ///
    /// Relation filters take part through a key semi-join so they still
    /// decide which roots qualify. An ordering on a relation needs the joins
    /// inside the page: the rows are grouped per root and sorted by `MIN` of
    /// the related column when ascending, `MAX` when descending, which is the
    /// first value the outer ordering meets for that root.
    fn root_page(
        &self,
        prepared: &Prepared,
        request: &QueryRequest,
        predicates: &[Predicate],
        joins: &[Join],
        select: Vec<SelectExpr>,
    ) -> QueryResult<Query> {
        let root_ty = self.schema.entity(request.root);
        let root_table = root_ty.table.as_str();
        let pk = table_col(root_table, &root_ty.pk_column().db_name);
        let by_relation = prepared.orders.iter().any(|o| !o.path.is_empty());

        let mut page = Query::new()
            .select(select)
            .from(TableRef::new(root_table));

        if by_relation {
            tracing::trace!(root = %root_ty.name, "grouping page rows for a relation ordering");
            page.joins = joins.to_vec();
            page.where_clause = and_all(predicates.iter().map(|p| p.expr.clone()).collect());
            page = page.group_by(
                root_ty
                    .columns
                    .iter()
                    .map(|c| table_col(root_table, &c.db_name))
                    .collect(),
            );
        } else {
            let mut conds: Vec<Expr> = predicates
                .iter()
                .filter(|p| p.root_only)
                .map(|p| p.expr.clone())
                .collect();
            let relation_conds: Vec<Expr> = predicates
                .iter()
                .filter(|p| !p.root_only)
                .map(|p| p.expr.clone())
                .collect();
            if !relation_conds.is_empty() {
                let mut matching = Query::new()
                    .select(vec![pk.clone()])
                    .from(TableRef::new(root_table));
                matching.joins = joins.to_vec();
                matching.where_clause = and_all(relation_conds);
                conds.push(pk.clone().in_subquery(matching));
            }
            page.where_clause = and_all(conds);
        }

        let mut order_by = Vec::new();
        for order in &prepared.orders {
            let compiled = order.compile(&prepared.aliases, root_table)?;
            if order.path.is_empty() {
                order_by.push(compiled);
            } else if order.descending {
                order_by.push(OrderByExpr::desc(max(compiled.expr)));
            } else {
                order_by.push(OrderByExpr::asc(min(compiled.expr)));
            }
        }
        push_tie_break(&mut order_by, pk);

        page = page.order_by(order_by);
        if let Some(limit) = request.limit {
            page = page.limit(limit);
        }
        if let Some(offset) = request.offset {
            page = page.offset(offset);
        }
        Ok(page)
    }
}

fn push_tie_break(orders: &mut Vec<OrderByExpr>, expr: Expr) {
    if !orders.iter().any(|o| o.expr == expr) {
        orders.push(OrderByExpr::asc(expr));
    }
}
