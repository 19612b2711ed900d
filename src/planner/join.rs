//! Join set bookkeeping, ON conditions and the join tree handed to the
//! materializer.

use crate::alias::{Alias, AliasPlan};
use crate::error::{QueryError, QueryResult};
use crate::excludable::ExcludableSet;
use crate::path::{RelationPath, ResolvedPath};
use crate::schema::{EntityId, EntityType, RelationId, RelationKind, Schema};
use crate::sql::{table_col, Expr, ExprExt, Join, SelectExpr, TableRef};

/// Requested join paths with implied prefixes collapsed.
///
/// Only leaves are stored; a path that is a prefix of a stored leaf is already
/// implied and is not added again.
#[derive(Debug, Clone, Default)]
pub struct JoinSet {
    leaves: Vec<RelationPath>,
}

impl JoinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `path`, returning false if it was already implied.
    pub fn add(&mut self, path: RelationPath) -> bool {
        if path.is_empty() || self.contains(&path) {
            return false;
        }
        self.leaves.retain(|leaf| !leaf.is_prefix_of(&path));
        self.leaves.push(path);
        true
    }

    /// True if `path` is joined, directly or as a prefix of a longer path.
    pub fn contains(&self, path: &RelationPath) -> bool {
        self.leaves.iter().any(|leaf| path.is_prefix_of(leaf))
    }

    pub fn leaves(&self) -> &[RelationPath] {
        &self.leaves
    }

    /// Every joined path including implied prefixes. Shorter paths come
    /// before the paths extending them; otherwise declaration order holds.
    pub fn expanded(&self) -> Vec<RelationPath> {
        let mut out: Vec<RelationPath> = Vec::new();
        for leaf in &self.leaves {
            for prefix in leaf.prefixes() {
                if !out.contains(&prefix) {
                    out.push(prefix);
                }
            }
        }
        out.sort_by_key(RelationPath::len);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// One selected column and the label it is read back under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedColumn {
    pub field: String,
    pub db_name: String,
    pub label: String,
}

/// A joined relation in the materialization tree.
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub relation: RelationId,
    pub name: String,
    pub path: RelationPath,
    pub target: EntityId,
    pub alias: Alias,
    pub to_many: bool,
    /// Built with validation skipped because the projection is partial.
    pub partial: bool,
    pub columns: Vec<SelectedColumn>,
    pub children: Vec<JoinNode>,
}

/// Root of the materialization tree.
#[derive(Debug, Clone)]
pub struct JoinTree {
    pub root: EntityId,
    pub columns: Vec<SelectedColumn>,
    pub children: Vec<JoinNode>,
}

impl JoinTree {
    /// Build the tree for every loaded path in `resolved`.
    pub(crate) fn build(
        schema: &Schema,
        root: EntityId,
        resolved: &[ResolvedPath],
        aliases: &AliasPlan,
        excludable: &ExcludableSet,
        partial: &[RelationPath],
    ) -> QueryResult<Self> {
        let root_ty = schema.entity(root);
        let columns = select_columns(root_ty, excludable, None);
        let children = build_children(
            schema,
            &RelationPath::root(),
            resolved,
            aliases,
            excludable,
            partial,
        )?;
        Ok(Self {
            root,
            columns,
            children,
        })
    }

    /// True if `path` is materialized from the joined rows.
    pub fn contains(&self, path: &RelationPath) -> bool {
        let mut nodes = &self.children;
        for segment in path.segments() {
            match nodes.iter().find(|n| &n.name == segment) {
                Some(node) => nodes = &node.children,
                None => return false,
            }
        }
        true
    }

    /// Every select-list entry, root columns first, then each node depth-first.
    pub fn select_list(&self, root_table: &str) -> Vec<SelectExpr> {
        let mut out: Vec<SelectExpr> = self
            .columns
            .iter()
            .map(|c| table_col(root_table, &c.db_name).alias(&c.label))
            .collect();
        fn walk(nodes: &[JoinNode], out: &mut Vec<SelectExpr>) {
            for node in nodes {
                out.extend(
                    node.columns
                        .iter()
                        .map(|c| table_col(node.alias.as_str(), &c.db_name).alias(&c.label)),
                );
                walk(&node.children, out);
            }
        }
        walk(&self.children, &mut out);
        out
    }
}

fn build_children(
    schema: &Schema,
    parent: &RelationPath,
    resolved: &[ResolvedPath],
    aliases: &AliasPlan,
    excludable: &ExcludableSet,
    partial: &[RelationPath],
) -> QueryResult<Vec<JoinNode>> {
    let mut nodes = Vec::new();
    for rp in resolved
        .iter()
        .filter(|rp| rp.path.len() == parent.len() + 1 && parent.is_prefix_of(&rp.path))
    {
        if excludable.excludes_path(&rp.path) {
            continue;
        }
        let rel_id = rp.last_relation();
        let rel = schema.relation(rel_id);
        let alias = aliases
            .get(&rp.path)
            .map(|ja| ja.target.clone())
            .ok_or_else(|| QueryError::unknown_relation(rp.path.to_string(), rel.name.clone()))?;
        let target_ty = schema.entity(rp.target);
        nodes.push(JoinNode {
            relation: rel_id,
            name: rel.name.clone(),
            path: rp.path.clone(),
            target: rp.target,
            columns: select_columns(target_ty, excludable.at(&rp.path), Some(&alias)),
            alias,
            to_many: rel.is_to_many(),
            partial: partial.contains(&rp.path),
            children: build_children(schema, &rp.path, resolved, aliases, excludable, partial)?,
        });
    }
    Ok(nodes)
}

fn select_columns(
    ty: &EntityType,
    excludable: &ExcludableSet,
    alias: Option<&Alias>,
) -> Vec<SelectedColumn> {
    ty.columns
        .iter()
        .filter(|c| excludable.is_included(&c.name))
        .map(|c| SelectedColumn {
            field: c.name.clone(),
            db_name: c.db_name.clone(),
            label: alias.map_or_else(|| c.name.clone(), |a| a.label(&c.name)),
        })
        .collect()
}

/// Backing column name of `field`, falling back to the field name.
pub(crate) fn db_name<'a>(ty: &'a EntityType, field: &'a str) -> &'a str {
    ty.column(field).map_or(field, |c| c.db_name.as_str())
}

/// LEFT OUTER JOIN clauses for one resolved path. Many-to-many paths yield
/// two clauses, through-table first.
pub(crate) fn join_clauses(
    schema: &Schema,
    resolved: &ResolvedPath,
    aliases: &AliasPlan,
    root_table: &str,
) -> QueryResult<Vec<Join>> {
    let rel = schema.relation(resolved.last_relation());
    let owner = schema.entity(rel.owner);
    let target = schema.entity(rel.target);
    let parent = resolved.path.parent().unwrap_or_default();
    let from = aliases.qualifier(&parent, root_table)?;
    let alias = aliases.qualifier(&resolved.path, root_table)?;
    let target_pk = table_col(alias, &target.pk_column().db_name);

    let left = |table: &str, alias: &str, on: Expr| Join {
        table: TableRef::new(table).with_alias(alias),
        on,
    };

    let clauses = match rel.kind {
        RelationKind::ForeignKey => vec![left(
            &target.table,
            alias,
            table_col(from, db_name(owner, &rel.key_field)).eq(target_pk),
        )],
        RelationKind::ReverseForeignKey => vec![left(
            &target.table,
            alias,
            table_col(from, &owner.pk_column().db_name)
                .eq(table_col(alias, db_name(target, &rel.key_field))),
        )],
        RelationKind::ManyToMany => {
            let through = schema.entity(rel.through.unwrap_or(rel.target));
            let through_alias = aliases
                .get(&resolved.path)
                .and_then(|ja| ja.through.as_ref())
                .map_or(alias, Alias::as_str);
            let target_field = rel.target_key_field.as_deref().unwrap_or_default();
            vec![
                left(
                    &through.table,
                    through_alias,
                    table_col(from, &owner.pk_column().db_name)
                        .eq(table_col(through_alias, db_name(through, &rel.key_field))),
                ),
                left(
                    &target.table,
                    alias,
                    table_col(through_alias, db_name(through, target_field)).eq(target_pk),
                ),
            ]
        }
    };
    Ok(clauses)
}
