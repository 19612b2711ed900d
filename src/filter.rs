//! Filter trees and their compilation to SQL predicates.
//!
//! Compilation happens in two steps. [`PredicateBuilder::bind`] resolves every
//! lookup against the schema and normalizes its value, which tells the planner
//! which relation paths must be joined. Once aliases are assigned,
//! [`BoundFilter::compile`] renders the predicate expression.

use std::collections::BTreeMap;

use crate::alias::AliasPlan;
use crate::error::{QueryError, QueryResult};
use crate::materialize::Instance;
use crate::path::{FieldRef, Lookup, Operator, OrderSpec, RelationPath, Resolver};
use crate::schema::EntityId;
use crate::sql::{and_all, lit_bool, or_all, param, table_col, Expr, ExprExt, OrderByExpr};
use crate::value::Value;

/// Escape character used in every generated LIKE pattern.
pub const LIKE_ESCAPE: char = '\\';

/// A value supplied to a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    Scalar(Value),
    /// A bare primary key of a related entity.
    PrimaryKey(Value),
    /// A materialized instance; compared by its primary key.
    Instance(Box<Instance>),
    /// Field payload of a related entity; compared by its primary-key entry.
    Payload(BTreeMap<String, Value>),
    List(Vec<ValueRef>),
}

impl From<Value> for ValueRef {
    fn from(v: Value) -> Self {
        ValueRef::Scalar(v)
    }
}

impl From<i64> for ValueRef {
    fn from(n: i64) -> Self {
        ValueRef::Scalar(Value::Int(n))
    }
}

impl From<i32> for ValueRef {
    fn from(n: i32) -> Self {
        ValueRef::Scalar(Value::Int(n as i64))
    }
}

impl From<f64> for ValueRef {
    fn from(x: f64) -> Self {
        ValueRef::Scalar(Value::Float(x))
    }
}

impl From<bool> for ValueRef {
    fn from(b: bool) -> Self {
        ValueRef::Scalar(Value::Bool(b))
    }
}

impl From<&str> for ValueRef {
    fn from(s: &str) -> Self {
        ValueRef::Scalar(Value::Text(s.to_string()))
    }
}

impl From<String> for ValueRef {
    fn from(s: String) -> Self {
        ValueRef::Scalar(Value::Text(s))
    }
}

impl From<Instance> for ValueRef {
    fn from(instance: Instance) -> Self {
        ValueRef::Instance(Box::new(instance))
    }
}

impl<T: Into<ValueRef>> From<Vec<T>> for ValueRef {
    fn from(items: Vec<T>) -> Self {
        ValueRef::List(items.into_iter().map(Into::into).collect())
    }
}

/// A boolean tree of lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Lookup { lookup: String, value: ValueRef },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn lookup(lookup: impl Into<String>, value: impl Into<ValueRef>) -> Self {
        Filter::Lookup {
            lookup: lookup.into(),
            value: value.into(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }
}

impl std::ops::Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        self.negate()
    }
}

/// A compiled predicate with the join paths it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub expr: Expr,
    pub paths: Vec<RelationPath>,
    /// True if only root columns are referenced.
    pub root_only: bool,
}

/// Normalized lookup value.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    One(Value),
    Many(Vec<Value>),
    Flag(bool),
}

/// A single resolved comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCond {
    pub lookup: String,
    /// Relation path owning the compared column; empty for the root.
    pub path: RelationPath,
    pub column: String,
    pub operator: Operator,
    pub value: BoundValue,
}

/// A filter tree resolved against the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundFilter {
    Cond(BoundCond),
    And(Vec<BoundFilter>),
    Or(Vec<BoundFilter>),
    Not(Box<BoundFilter>),
}

impl BoundFilter {
    /// Distinct non-root relation paths referenced, in first-use order.
    pub fn paths(&self) -> Vec<RelationPath> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<RelationPath>) {
        match self {
            BoundFilter::Cond(cond) => {
                if !cond.path.is_empty() && !out.contains(&cond.path) {
                    out.push(cond.path.clone());
                }
            }
            BoundFilter::And(items) | BoundFilter::Or(items) => {
                items.iter().for_each(|f| f.collect_paths(out))
            }
            BoundFilter::Not(inner) => inner.collect_paths(out),
        }
    }

    pub fn is_root_only(&self) -> bool {
        match self {
            BoundFilter::Cond(cond) => cond.path.is_empty(),
            BoundFilter::And(items) | BoundFilter::Or(items) => {
                items.iter().all(BoundFilter::is_root_only)
            }
            BoundFilter::Not(inner) => inner.is_root_only(),
        }
    }

    /// Render against assigned aliases. `root` qualifies root columns.
    pub fn compile(&self, aliases: &AliasPlan, root: &str) -> QueryResult<Predicate> {
        Ok(Predicate {
            expr: self.to_expr(aliases, root)?,
            paths: self.paths(),
            root_only: self.is_root_only(),
        })
    }

    fn to_expr(&self, aliases: &AliasPlan, root: &str) -> QueryResult<Expr> {
        match self {
            BoundFilter::Cond(cond) => cond.to_expr(aliases, root),
            BoundFilter::And(items) => {
                let exprs = items
                    .iter()
                    .map(|f| f.to_expr(aliases, root))
                    .collect::<QueryResult<Vec<_>>>()?;
                Ok(and_all(exprs).unwrap_or_else(|| lit_bool(true)))
            }
            BoundFilter::Or(items) => {
                let exprs = items
                    .iter()
                    .map(|f| f.to_expr(aliases, root))
                    .collect::<QueryResult<Vec<_>>>()?;
                Ok(or_all(exprs).unwrap_or_else(|| lit_bool(false)))
            }
            BoundFilter::Not(inner) => Ok(inner.to_expr(aliases, root)?.not()),
        }
    }
}

impl BoundCond {
    fn to_expr(&self, aliases: &AliasPlan, root: &str) -> QueryResult<Expr> {
        let column = table_col(aliases.qualifier(&self.path, root)?, &self.column);

        let expr = match (&self.operator, &self.value) {
            (Operator::Exact | Operator::IExact, BoundValue::One(Value::Null)) => column.is_null(),
            (Operator::Exact, BoundValue::One(v)) => column.eq(param(v.clone())),
            (Operator::IExact, BoundValue::One(v)) => lower(column).eq(lower(param(v.clone()))),
            (Operator::IsNull, BoundValue::Flag(true)) => column.is_null(),
            (Operator::IsNull, BoundValue::Flag(false)) => column.is_not_null(),
            (Operator::In, BoundValue::Many(values)) => {
                column.in_list(values.iter().cloned().map(param).collect())
            }
            (Operator::Gt, BoundValue::One(v)) => column.gt(param(v.clone())),
            (Operator::Gte, BoundValue::One(v)) => column.gte(param(v.clone())),
            (Operator::Lt, BoundValue::One(v)) => column.lt(param(v.clone())),
            (Operator::Lte, BoundValue::One(v)) => column.lte(param(v.clone())),
            (op, BoundValue::One(Value::Text(pattern))) if op.is_like() => {
                let pattern = param(Value::Text(pattern.clone()));
                if op.is_case_insensitive() {
                    column.ilike_escape(pattern, LIKE_ESCAPE)
                } else {
                    column.like_escape(pattern, LIKE_ESCAPE)
                }
            }
            (op, _) => {
                return Err(QueryError::invalid_value(
                    &self.lookup,
                    format!("value does not fit operator `{}`", op),
                ))
            }
        };
        Ok(expr)
    }
}

fn lower(expr: Expr) -> Expr {
    Expr::Function {
        name: "LOWER".into(),
        args: vec![expr],
        distinct: false,
    }
}

/// Escape LIKE wildcards so `raw` matches literally.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for ch in raw.chars() {
        if ch == LIKE_ESCAPE || ch == '%' || ch == '_' {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out
}

/// Resolves filters against a root entity.
#[derive(Debug, Clone, Copy)]
pub struct PredicateBuilder<'s> {
    resolver: Resolver<'s>,
}

impl<'s> PredicateBuilder<'s> {
    pub fn new(resolver: Resolver<'s>) -> Self {
        Self { resolver }
    }

    pub fn bind(&self, filter: &Filter) -> QueryResult<BoundFilter> {
        match filter {
            Filter::Lookup { lookup, value } => self.bind_lookup(lookup, value).map(BoundFilter::Cond),
            Filter::And(items) => items
                .iter()
                .map(|f| self.bind(f))
                .collect::<QueryResult<_>>()
                .map(BoundFilter::And),
            Filter::Or(items) => items
                .iter()
                .map(|f| self.bind(f))
                .collect::<QueryResult<_>>()
                .map(BoundFilter::Or),
            Filter::Not(inner) => Ok(BoundFilter::Not(Box::new(self.bind(inner)?))),
        }
    }

    fn bind_lookup(&self, raw: &str, value: &ValueRef) -> QueryResult<BoundCond> {
        let lookup = Lookup::parse(raw);
        let schema = self.resolver.schema();
        let target = self.resolver.resolve_field(raw, &lookup.parts)?;
        let (path, entity, field) = target.column_path(schema);
        let column = schema
            .entity(entity)
            .column(field)
            .ok_or_else(|| QueryError::unknown_field(&schema.entity(entity).name, field))?;

        // The entity whose primary key an instance or payload value stands for.
        let referenced = match target.field {
            FieldRef::Relation(rel) => schema.relation(rel).target,
            FieldRef::Column(_) => entity,
        };

        let operator = lookup.operator;
        let value = match operator {
            Operator::IsNull => match value {
                ValueRef::Scalar(v) => BoundValue::Flag(v.as_bool().ok_or_else(|| {
                    QueryError::invalid_value(raw, "isnull expects a boolean")
                })?),
                _ => return Err(QueryError::invalid_value(raw, "isnull expects a boolean")),
            },
            Operator::In => match value {
                ValueRef::List(items) => BoundValue::Many(
                    items
                        .iter()
                        .map(|item| self.scalar(raw, item, referenced))
                        .collect::<QueryResult<_>>()?,
                ),
                _ => return Err(QueryError::invalid_value(raw, "in expects a list")),
            },
            op if op.is_like() => {
                let text = match value {
                    ValueRef::Scalar(Value::Null) => {
                        return Err(QueryError::invalid_value(raw, "pattern must not be null"))
                    }
                    ValueRef::Scalar(v) => v.to_string(),
                    _ => {
                        return Err(QueryError::invalid_value(
                            raw,
                            "text matching requires a plain value, not an instance",
                        ))
                    }
                };
                let escaped = escape_like(&text);
                let pattern = match op {
                    Operator::Contains | Operator::IContains => format!("%{}%", escaped),
                    Operator::StartsWith | Operator::IStartsWith => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                BoundValue::One(Value::Text(pattern))
            }
            Operator::Exact | Operator::IExact => BoundValue::One(self.scalar(raw, value, referenced)?),
            _ => {
                let v = self.scalar(raw, value, referenced)?;
                if v.is_null() {
                    return Err(QueryError::invalid_value(raw, "cannot compare with null"));
                }
                BoundValue::One(v)
            }
        };

        Ok(BoundCond {
            lookup: raw.to_string(),
            path,
            column: column.db_name.clone(),
            operator,
            value,
        })
    }

    fn scalar(&self, raw: &str, value: &ValueRef, referenced: EntityId) -> QueryResult<Value> {
        let schema = self.resolver.schema();
        match value {
            ValueRef::Scalar(v) | ValueRef::PrimaryKey(v) => Ok(v.clone()),
            ValueRef::Instance(instance) => Ok(instance.pk(schema).clone()),
            ValueRef::Payload(fields) => {
                let pk = &schema.entity(referenced).pk;
                fields.get(pk).cloned().ok_or_else(|| {
                    QueryError::invalid_value(raw, format!("payload has no `{}` entry", pk))
                })
            }
            ValueRef::List(_) => Err(QueryError::invalid_value(raw, "list values require `in`")),
        }
    }
}

/// An ordering resolved against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundOrder {
    pub path: RelationPath,
    pub column: String,
    pub descending: bool,
}

impl BoundOrder {
    pub fn compile(&self, aliases: &AliasPlan, root: &str) -> QueryResult<OrderByExpr> {
        let column = table_col(aliases.qualifier(&self.path, root)?, &self.column);
        Ok(if self.descending {
            OrderByExpr::desc(column)
        } else {
            OrderByExpr::asc(column)
        })
    }
}

/// Resolves orderings against a root entity.
#[derive(Debug, Clone, Copy)]
pub struct OrderBuilder<'s> {
    resolver: Resolver<'s>,
}

impl<'s> OrderBuilder<'s> {
    pub fn new(resolver: Resolver<'s>) -> Self {
        Self { resolver }
    }

    pub fn bind(&self, spec: &OrderSpec) -> QueryResult<BoundOrder> {
        let raw = spec.raw();
        let schema = self.resolver.schema();
        let target = self.resolver.resolve_field(&raw, &spec.parts)?;
        let (path, entity, field) = target.column_path(schema);
        let column = schema
            .entity(entity)
            .column(field)
            .ok_or_else(|| QueryError::unknown_field(&schema.entity(entity).name, field))?;
        Ok(BoundOrder {
            path,
            column: column.db_name.clone(),
            descending: spec.descending,
        })
    }
}
