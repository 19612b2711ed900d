//! Entry points: [`Engine`] owns the shared pieces, [`QuerySet`] describes
//! one query fluently and runs it.
//!
//! ```ignore
//! let engine = Engine::new(schema, SqliteBackend::open_in_memory()?);
//! let authors = engine
//!     .query("Author")?
//!     .filter("books__title__icontains", "rust")
//!     .select_related(["books"])
//!     .order_by(["-name"])
//!     .paginate(1, 20)
//!     .all()
//!     .await?;
//! ```

use std::sync::Arc;

use serde::Serialize;

use crate::alias::AliasRegistry;
use crate::backend::Backend;
use crate::config::EngineSettings;
use crate::error::{QueryError, QueryResult};
use crate::excludable::FieldSelection;
use crate::filter::{Filter, ValueRef};
use crate::materialize::{DefaultFactory, Instance, InstanceFactory, MergeEngine, RowMaterializer};
use crate::path::{OrderSpec, RelationPath, Resolver};
use crate::planner::{CompiledStatement, JoinPlanner, PlannedQuery, QueryRequest};
use crate::prefetch::{PrefetchPlan, PrefetchStep, Prefetcher};
use crate::schema::{EntityId, Schema};
use crate::value::Value;

/// Schema, alias registry, backend and factory shared by every query.
///
/// Cloning is cheap; clones share the alias registry.
pub struct Engine<B: Backend> {
    schema: Arc<Schema>,
    aliases: Arc<AliasRegistry>,
    backend: Arc<B>,
    factory: Arc<dyn InstanceFactory>,
    settings: Arc<EngineSettings>,
}

impl<B: Backend> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            aliases: Arc::clone(&self.aliases),
            backend: Arc::clone(&self.backend),
            factory: Arc::clone(&self.factory),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(schema: Schema, backend: B) -> Self {
        Self::with_settings(schema, backend, EngineSettings::default())
    }

    pub fn with_settings(schema: Schema, backend: B, settings: EngineSettings) -> Self {
        Self {
            schema: Arc::new(schema),
            aliases: Arc::new(AliasRegistry::new(settings.aliases.effective_length())),
            backend: Arc::new(backend),
            factory: Arc::new(DefaultFactory),
            settings: Arc::new(settings),
        }
    }

    /// Replace the instance factory.
    pub fn with_factory(mut self, factory: impl InstanceFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn aliases(&self) -> &AliasRegistry {
        &self.aliases
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start a query rooted at entity `name`.
    pub fn query(&self, name: &str) -> QueryResult<QuerySet<'_, B>> {
        let root = self.schema.entity_id(name)?;
        Ok(QuerySet::new(self, root))
    }

    pub(crate) fn executor(&self) -> Executor<'_> {
        Executor {
            schema: &self.schema,
            aliases: &self.aliases,
            settings: &self.settings,
            backend: self.backend.as_ref(),
            factory: self.factory.as_ref(),
        }
    }
}

/// Borrowed view of an engine used while one query runs.
pub(crate) struct Executor<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) aliases: &'a AliasRegistry,
    pub(crate) settings: &'a EngineSettings,
    pub(crate) backend: &'a dyn Backend,
    pub(crate) factory: &'a dyn InstanceFactory,
}

impl<'a> Executor<'a> {
    pub(crate) fn planner(&self) -> JoinPlanner<'a> {
        JoinPlanner::new(self.schema, self.aliases, self.settings)
    }

    /// Plan, execute, materialize and merge one statement.
    pub(crate) async fn fetch(&self, request: &QueryRequest) -> QueryResult<(Vec<Instance>, PlannedQuery)> {
        let planned = self.planner().plan(request)?;
        let rows = self.backend.execute(&planned.statement).await?;
        let instances = RowMaterializer::new(self.schema, self.factory).materialize(&rows, &planned.tree)?;
        let merged = MergeEngine::new(self.schema).merge(instances);
        tracing::trace!(rows = rows.len(), instances = merged.len(), "materialized statement");
        Ok((merged, planned))
    }
}

/// Main statement plus the follow-up statements it would trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub prefetch: Vec<PrefetchStep>,
}

impl CompiledQuery {
    pub fn statement(&self) -> CompiledStatement {
        CompiledStatement {
            sql: self.sql.clone(),
            params: self.params.clone(),
        }
    }
}

/// A lazily evaluated query.
///
/// Builder methods consume and return the set; nothing runs until one of
/// the async entry points is awaited.
pub struct QuerySet<'e, B: Backend> {
    engine: &'e Engine<B>,
    root: EntityId,
    filters: Vec<Filter>,
    select_related: Vec<RelationPath>,
    prefetch_related: Vec<RelationPath>,
    fields: Vec<FieldSelection>,
    exclude_fields: Vec<FieldSelection>,
    order_by: Vec<OrderSpec>,
    limit: Option<u64>,
    offset: Option<u64>,
    limit_raw_sql: bool,
}

impl<B: Backend> Clone for QuerySet<'_, B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine,
            root: self.root,
            filters: self.filters.clone(),
            select_related: self.select_related.clone(),
            prefetch_related: self.prefetch_related.clone(),
            fields: self.fields.clone(),
            exclude_fields: self.exclude_fields.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            limit_raw_sql: self.limit_raw_sql,
        }
    }
}

impl<'e, B: Backend> QuerySet<'e, B> {
    fn new(engine: &'e Engine<B>, root: EntityId) -> Self {
        Self {
            engine,
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
        }
    }

    /// Keep rows matching `lookup`, e.g. `("books__title__icontains", "rust")`.
    pub fn filter(mut self, lookup: &str, value: impl Into<ValueRef>) -> Self {
        self.filters.push(Filter::lookup(lookup, value));
        self
    }

    /// Drop rows matching `lookup`.
    pub fn exclude(mut self, lookup: &str, value: impl Into<ValueRef>) -> Self {
        self.filters.push(Filter::lookup(lookup, value).negate());
        self
    }

    /// Keep rows matching a filter tree built with [`Filter::and`],
    /// [`Filter::or`] and [`Filter::negate`].
    pub fn filter_group(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Load relations through joins in the main statement.
    pub fn select_related<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<RelationPath>,
    {
        self.select_related.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Load relations through one follow-up statement per level.
    pub fn prefetch_related<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<RelationPath>,
    {
        self.prefetch_related.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Restrict the projection. Repeated calls union.
    pub fn fields(mut self, selection: impl Into<FieldSelection>) -> Self {
        self.fields.push(selection.into());
        self
    }

    pub fn exclude_fields(mut self, selection: impl Into<FieldSelection>) -> Self {
        self.exclude_fields.push(selection.into());
        self
    }

    /// Append orderings such as `"-name"` or `"books__title"`.
    pub fn order_by<I, O>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<OrderSpec>,
    {
        self.order_by.extend(specs.into_iter().map(Into::into));
        self
    }

    /// Cap the number of root entities.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// One-based page of `page_size` roots.
    pub fn paginate(self, page: u64, page_size: u64) -> Self {
        let offset = page.max(1).saturating_sub(1).saturating_mul(page_size);
        self.limit(page_size).offset(offset)
    }

    /// Apply limit and offset to raw joined rows instead of root entities.
    pub fn limit_raw_sql(mut self, raw: bool) -> Self {
        self.limit_raw_sql = raw;
        self
    }

    /// Compile without executing.
    pub fn compile(&self) -> QueryResult<CompiledQuery> {
        let executor = self.engine.executor();
        let (request, prefetch_orders) = self.request()?;
        let planned = executor.planner().plan(&request)?;
        let plan = self.prefetch_plan(&request, &planned, &prefetch_orders)?;
        Ok(CompiledQuery {
            sql: planned.statement.sql,
            params: planned.statement.params,
            prefetch: plan.outline(executor.schema),
        })
    }

    /// Every matching root, deduplicated, with requested relations loaded.
    pub async fn all(&self) -> QueryResult<Vec<Instance>> {
        let executor = self.engine.executor();
        let (request, prefetch_orders) = self.request()?;
        let (mut instances, planned) = executor.fetch(&request).await?;
        let plan = self.prefetch_plan(&request, &planned, &prefetch_orders)?;
        Prefetcher::new(&executor).run(plan, &mut instances).await?;
        Ok(instances)
    }

    /// Exactly one matching root.
    pub async fn get(&self) -> QueryResult<Instance> {
        let mut found = self.all().await?;
        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err(QueryError::NoMatchingRows {
                entity: self.root_name(),
            }),
            count => Err(QueryError::MultipleMatchingRows {
                entity: self.root_name(),
                count,
            }),
        }
    }

    pub async fn get_or_none(&self) -> QueryResult<Option<Instance>> {
        match self.get().await {
            Ok(instance) => Ok(Some(instance)),
            Err(QueryError::NoMatchingRows { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// First root by the requested ordering, or by primary key if none.
    pub async fn first(&self) -> QueryResult<Instance> {
        let mut query = self.clone().limit(1);
        if query.order_by.is_empty() {
            query.order_by.push(OrderSpec::asc(crate::path::PK_ALIAS));
        }
        query
            .all()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::NoMatchingRows {
                entity: self.root_name(),
            })
    }

    /// Distinct matching roots, ignoring limit and offset.
    pub async fn count(&self) -> QueryResult<u64> {
        let executor = self.engine.executor();
        let (request, _) = self.request()?;
        let statement = executor.planner().plan_count(&request)?;
        let rows = executor.backend.execute(&statement).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn exists(&self) -> QueryResult<bool> {
        Ok(self.count().await? > 0)
    }

    fn root_name(&self) -> String {
        self.engine.schema.entity(self.root).name.clone()
    }

    /// Request for the main statement, plus orderings that belong to
    /// prefetched relations. Prefetch paths are validated here so bad paths
    /// fail before anything executes.
    fn request(&self) -> QueryResult<(QueryRequest, Vec<OrderSpec>)> {
        let schema = self.engine.schema.as_ref();
        let resolver = Resolver::new(schema, self.root);
        for path in &self.prefetch_related {
            resolver.resolve(path)?;
        }

        let (main_orders, prefetch_orders) =
            PrefetchPlan::split_orders(&self.order_by, &self.prefetch_related, &self.select_related);

        let mut request = QueryRequest::new(self.root);
        request.filters = self.filters.clone();
        request.select_related = self.select_related.clone();
        request.prefetch_related = self.prefetch_related.clone();
        request.fields = self.fields.clone();
        request.exclude_fields = self.exclude_fields.clone();
        request.order_by = main_orders;
        request.limit = self.limit;
        request.offset = self.offset;
        request.limit_raw_sql = self.limit_raw_sql;
        request.required = PrefetchPlan::required_keys(schema, self.root, &self.prefetch_related);
        Ok((request, prefetch_orders))
    }

    fn prefetch_plan(
        &self,
        request: &QueryRequest,
        planned: &PlannedQuery,
        orders: &[OrderSpec],
    ) -> QueryResult<PrefetchPlan> {
        PrefetchPlan::build(
            &self.engine.schema,
            request.root,
            &request.prefetch_related,
            &planned.tree,
            &planned.excludable,
            orders,
        )
    }
}
