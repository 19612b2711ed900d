//! Loading relations through follow-up statements.
//!
//! A [`PrefetchPlan`] is a tree of relation nodes below the root. Each
//! pending node issues one statement filtered on the keys of its parent
//! level, so a level costs one round trip however many parents it has.
//! Nodes the main statement already joined skip the round trip and hand
//! their in-memory instances down as parents.
//!
//! Loading and attaching are separate passes: nothing is attached to the
//! caller's instances until every level has loaded, so a failed statement
//! leaves them untouched.

use std::collections::{HashMap, HashSet};
use std::fmt;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;

use crate::error::QueryResult;
use crate::excludable::{ExcludableSet, FieldSelection};
use crate::filter::{Filter, ValueRef};
use crate::materialize::{Instance, Related};
use crate::path::{OrderSpec, RelationPath, Resolver, PK_ALIAS};
use crate::planner::{JoinTree, QueryRequest};
use crate::queryset::Executor;
use crate::schema::{EntityId, RelationId, RelationKind, Schema};
use crate::value::Value;

/// Lifecycle of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Loading,
    Loaded,
    /// Satisfied by a join in the parent statement.
    AlreadyLoaded,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Pending => "pending",
            NodeState::Loading => "loading",
            NodeState::Loaded => "loaded",
            NodeState::AlreadyLoaded => "already_loaded",
        })
    }
}

/// One relation to load.
#[derive(Debug, Clone)]
pub struct PrefetchNode {
    /// Full path from the query root.
    pub path: RelationPath,
    pub name: String,
    pub relation: RelationId,
    pub state: NodeState,
    projection: ExcludableSet,
    order_by: Vec<OrderSpec>,
    instances: Vec<Instance>,
    /// Relation key to positions in `instances`, in query order.
    groups: HashMap<Value, Vec<usize>>,
    pub children: Vec<PrefetchNode>,
}

impl PrefetchNode {
    fn new(path: RelationPath, relation: RelationId, state: NodeState, projection: ExcludableSet) -> Self {
        Self {
            name: path.last().unwrap_or_default().to_string(),
            path,
            relation,
            state,
            projection,
            order_by: Vec::new(),
            instances: Vec::new(),
            groups: HashMap::new(),
            children: Vec::new(),
        }
    }
}

/// A step of the plan as reported by `QuerySet::compile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefetchStep {
    pub path: String,
    pub relation: String,
    pub state: NodeState,
    /// Orderings applied to the follow-up statement.
    pub order_by: Vec<String>,
}

/// The tree of relations to load after the main statement.
#[derive(Debug, Clone, Default)]
pub struct PrefetchPlan {
    pub nodes: Vec<PrefetchNode>,
}

impl PrefetchPlan {
    /// Build the tree for `paths` under `root`.
    ///
    /// Paths the main statement joined become already-loaded nodes. Paths
    /// crossing an excluded relation are dropped. `order_by` entries are
    /// attached to the deepest node they fall under.
    pub fn build(
        schema: &Schema,
        root: EntityId,
        paths: &[RelationPath],
        tree: &JoinTree,
        excludable: &ExcludableSet,
        order_by: &[OrderSpec],
    ) -> QueryResult<Self> {
        let resolver = Resolver::new(schema, root);
        let mut plan = Self::default();

        for path in paths {
            let resolved = resolver.resolve(path)?;
            if path.is_empty() {
                continue;
            }
            if excludable.excludes_path(path) {
                tracing::trace!(path = %path, "relation excluded, not prefetched");
                continue;
            }
            if tree.contains(path) {
                tracing::warn!(path = %path, "prefetch path already loaded by a join");
            }

            let mut level = &mut plan.nodes;
            for (depth, prefix) in path.prefixes().enumerate() {
                let name = prefix.last().unwrap_or_default().to_string();
                let slot = match level.iter().position(|n| n.name == name) {
                    Some(slot) => slot,
                    None => {
                        let state = if tree.contains(&prefix) {
                            NodeState::AlreadyLoaded
                        } else {
                            NodeState::Pending
                        };
                        let projection = excludable.at(&prefix).clone();
                        level.push(PrefetchNode::new(
                            prefix,
                            resolved.hops[depth],
                            state,
                            projection,
                        ));
                        level.len() - 1
                    }
                };
                level = &mut level[slot].children;
            }
        }

        for order in order_by {
            let full = RelationPath::from_segments(order.parts.clone());
            match deepest_pending(&mut plan.nodes, &full) {
                Some(node) => {
                    let rest = node.path.strip_from(&full).unwrap_or_default();
                    node.order_by.push(OrderSpec {
                        parts: rest.segments().to_vec(),
                        descending: order.descending,
                    });
                }
                None => {
                    tracing::warn!(order = %order.raw(), "ordering matches no prefetched relation");
                }
            }
        }
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order listing of every node.
    pub fn outline(&self, schema: &Schema) -> Vec<PrefetchStep> {
        fn walk(nodes: &[PrefetchNode], schema: &Schema, out: &mut Vec<PrefetchStep>) {
            for node in nodes {
                let rel = schema.relation(node.relation);
                out.push(PrefetchStep {
                    path: node.path.to_string(),
                    relation: format!("{}.{}", schema.entity(rel.owner).name, rel.name),
                    state: node.state,
                    order_by: node.order_by.iter().map(OrderSpec::raw).collect(),
                });
                walk(&node.children, schema, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, schema, &mut out);
        out
    }

    /// Split orderings into those of the main statement and those of
    /// follow-up statements, given the paths the main statement joins.
    pub(crate) fn split_orders(
        order_by: &[OrderSpec],
        prefetch: &[RelationPath],
        joined: &[RelationPath],
    ) -> (Vec<OrderSpec>, Vec<OrderSpec>) {
        let is_prefetched = |order: &OrderSpec| {
            let full = RelationPath::from_segments(order.parts.clone());
            prefetch.iter().any(|p| {
                p.prefixes().any(|prefix| {
                    prefix.len() < full.len()
                        && prefix.is_prefix_of(&full)
                        && !joined.iter().any(|j| prefix.is_prefix_of(j))
                })
            })
        };
        order_by.iter().cloned().partition(|o| !is_prefetched(o))
    }

    /// Fields the parent levels must select for the plan to stitch.
    pub(crate) fn required_keys(schema: &Schema, root: EntityId, paths: &[RelationPath]) -> Vec<(RelationPath, String)> {
        let resolver = Resolver::new(schema, root);
        let mut out = Vec::new();
        for path in paths {
            let Ok(resolved) = resolver.resolve(path) else {
                continue;
            };
            for (prefix, hop) in path.prefixes().zip(resolved.hops.iter()) {
                let rel = schema.relation(*hop);
                if rel.kind == RelationKind::ForeignKey {
                    let key = (prefix.parent().unwrap_or_default(), rel.key_field.clone());
                    if !out.contains(&key) {
                        out.push(key);
                    }
                }
            }
        }
        out
    }
}

/// Runs a plan against materialized root instances.
pub(crate) struct Prefetcher<'e> {
    executor: &'e Executor<'e>,
}

impl<'e> Prefetcher<'e> {
    pub(crate) fn new(executor: &'e Executor<'e>) -> Self {
        Self { executor }
    }

    /// Load every level, then attach bottom-up onto `roots`.
    pub(crate) async fn run(&self, mut plan: PrefetchPlan, roots: &mut [Instance]) -> QueryResult<()> {
        if plan.is_empty() || roots.is_empty() {
            return Ok(());
        }
        {
            let parents: Vec<&Instance> = roots.iter().collect();
            self.load_level(&mut plan.nodes, parents).await?;
        }
        let schema = self.executor.schema;
        for root in roots.iter_mut() {
            for node in &plan.nodes {
                attach(schema, node, root);
            }
        }
        Ok(())
    }

    async fn load_level<'a>(
        &'a self,
        nodes: &'a mut [PrefetchNode],
        parents: Vec<&'a Instance>,
    ) -> QueryResult<()> {
        if self.executor.settings.prefetch.concurrent_siblings {
            try_join_all(nodes.iter_mut().map(|node| self.load(node, parents.clone()))).await?;
        } else {
            for node in nodes.iter_mut() {
                self.load(node, parents.clone()).await?;
            }
        }
        Ok(())
    }

    fn load<'a>(
        &'a self,
        node: &'a mut PrefetchNode,
        parents: Vec<&'a Instance>,
    ) -> BoxFuture<'a, QueryResult<()>> {
        async move {
            let schema = self.executor.schema;
            if node.state == NodeState::AlreadyLoaded {
                tracing::debug!(path = %node.path, "prefetch node already loaded, descending");
                let next: Vec<&Instance> = parents
                    .iter()
                    .filter_map(|p| p.related(&node.name))
                    .flat_map(Related::instances)
                    .collect();
                return self.load_level(&mut node.children, next).await;
            }

            let rel = schema.relation(node.relation);
            let keys = parent_keys(schema, rel.kind, &rel.key_field, &parents);
            tracing::debug!(
                path = %node.path,
                from = %node.state,
                to = %NodeState::Loading,
                keys = keys.len(),
                "prefetch node transition"
            );
            node.state = NodeState::Loading;

            if !keys.is_empty() {
                let request = self.child_request(node, keys);
                let (mut instances, _) = self.executor.fetch(&request).await?;
                node.groups = group_instances(schema, node.relation, &mut instances);
                node.instances = instances;
            }
            node.state = NodeState::Loaded;
            tracing::debug!(
                path = %node.path,
                to = %NodeState::Loaded,
                instances = node.instances.len(),
                "prefetch node transition"
            );

            let PrefetchNode {
                children,
                instances,
                ..
            } = node;
            if !children.is_empty() && !instances.is_empty() {
                self.load_level(children, instances.iter().collect()).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Follow-up request for one pending node, rooted at the relation target.
    fn child_request(&self, node: &PrefetchNode, keys: Vec<Value>) -> QueryRequest {
        let schema = self.executor.schema;
        let rel = schema.relation(node.relation);
        let mut request = QueryRequest::new(rel.target);
        request.projection = Some(node.projection.clone());
        request.order_by = node.order_by.clone();
        request.required = Self::required_for_children(schema, rel.target, node);

        let keys = ValueRef::List(keys.into_iter().map(ValueRef::Scalar).collect());
        match rel.kind {
            RelationKind::ForeignKey => {
                request
                    .filters
                    .push(Filter::lookup(format!("{PK_ALIAS}__in"), keys));
            }
            RelationKind::ReverseForeignKey => {
                request
                    .required
                    .push((RelationPath::root(), rel.key_field.clone()));
                request
                    .filters
                    .push(Filter::lookup(format!("{}__in", rel.key_field), keys));
            }
            RelationKind::ManyToMany => {
                let mirror = mirror_name(schema, node.relation);
                let mirror_path = RelationPath::root().child(&mirror);
                request.select_related.push(mirror_path.clone());
                request.partial_paths.push(mirror_path);
                request
                    .fields
                    .push(FieldSelection::Names(vec![format!("{mirror}__{PK_ALIAS}")]));
                request
                    .filters
                    .push(Filter::lookup(format!("{mirror}__{PK_ALIAS}__in"), keys));
            }
        }
        request
    }

    fn required_for_children(schema: &Schema, root: EntityId, node: &PrefetchNode) -> Vec<(RelationPath, String)> {
        let paths: Vec<RelationPath> = node
            .children
            .iter()
            .map(|c| node.path.strip_from(&c.path).unwrap_or_default())
            .collect();
        PrefetchPlan::required_keys(schema, root, &paths)
    }
}

fn is_under(node: &PrefetchNode, path: &RelationPath) -> bool {
    node.path.len() < path.len() && node.path.is_prefix_of(path)
}

fn has_pending_prefix(nodes: &[PrefetchNode], path: &RelationPath) -> bool {
    nodes.iter().any(|n| {
        is_under(n, path) && (n.state == NodeState::Pending || has_pending_prefix(&n.children, path))
    })
}

/// Deepest pending node whose path is a strict prefix of `path`.
fn deepest_pending<'n>(nodes: &'n mut [PrefetchNode], path: &RelationPath) -> Option<&'n mut PrefetchNode> {
    let node = nodes.iter_mut().find(|n| is_under(n, path))?;
    if has_pending_prefix(&node.children, path) {
        return deepest_pending(&mut node.children, path);
    }
    (node.state == NodeState::Pending).then_some(node)
}

/// Distinct non-null keys of `parents` that the child statement filters on.
fn parent_keys(schema: &Schema, kind: RelationKind, key_field: &str, parents: &[&Instance]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for parent in parents {
        let key = match kind {
            RelationKind::ForeignKey => parent.get(key_field),
            _ => Some(parent.pk(schema)),
        };
        if let Some(key) = key.filter(|k| !k.is_null()) {
            if seen.insert(key.clone()) {
                out.push(key.clone());
            }
        }
    }
    out
}

/// Index `instances` by the key their parents look them up with.
///
/// Many-to-many instances carry their owners through the mirror relation,
/// which is dropped once read.
fn group_instances(
    schema: &Schema,
    relation: RelationId,
    instances: &mut [Instance],
) -> HashMap<Value, Vec<usize>> {
    let rel = schema.relation(relation);
    let mut groups: HashMap<Value, Vec<usize>> = HashMap::new();
    for (idx, instance) in instances.iter_mut().enumerate() {
        match rel.kind {
            RelationKind::ForeignKey => {
                groups
                    .entry(instance.pk(schema).clone())
                    .or_default()
                    .push(idx);
            }
            RelationKind::ReverseForeignKey => {
                if let Some(key) = instance.get(&rel.key_field).filter(|k| !k.is_null()) {
                    groups.entry(key.clone()).or_default().push(idx);
                }
            }
            RelationKind::ManyToMany => {
                let mirror = mirror_name(schema, relation);
                if let Some(owners) = instance.take_related(&mirror) {
                    for owner in owners.instances() {
                        groups
                            .entry(owner.pk(schema).clone())
                            .or_default()
                            .push(idx);
                    }
                }
            }
        }
    }
    groups
}

fn mirror_name(schema: &Schema, relation: RelationId) -> String {
    let rel = schema.relation(relation);
    rel.mirror()
        .map(|m| schema.relation(m).name.clone())
        .unwrap_or_else(|| rel.name.clone())
}

/// Assign `node`'s results, and everything below it, onto `parent`.
fn attach(schema: &Schema, node: &PrefetchNode, parent: &mut Instance) {
    if node.state == NodeState::AlreadyLoaded {
        if let Some(related) = parent.related_mut(&node.name) {
            for child in related.instances_mut() {
                for sub in &node.children {
                    attach(schema, sub, child);
                }
            }
        }
        return;
    }

    let rel = schema.relation(node.relation);
    let key = match rel.kind {
        RelationKind::ForeignKey => parent.get(&rel.key_field).cloned().unwrap_or_default(),
        _ => parent.pk(schema).clone(),
    };
    let mut matched: Vec<Instance> = node
        .groups
        .get(&key)
        .map(|idxs| idxs.iter().map(|&i| node.instances[i].clone()).collect())
        .unwrap_or_default();
    for child in matched.iter_mut() {
        for sub in &node.children {
            attach(schema, sub, child);
        }
    }

    let related = match rel.kind {
        RelationKind::ForeignKey => Related::One(matched.into_iter().next().map(Box::new)),
        _ => Related::Many(matched),
    };
    parent.set_related(node.name.clone(), related);
}
