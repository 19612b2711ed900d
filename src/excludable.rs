//! Field projection: which columns of each joined entity are selected and
//! which relations are dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{QueryError, QueryResult};
use crate::path::{RelationPath, PK_ALIAS};
use crate::schema::{EntityId, Schema};

/// User input to `fields` / `exclude_fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Flat names; nested entries use the path separator (`books__title`).
    Names(Vec<String>),
    /// Nested mapping keyed by field or relation name.
    Tree(BTreeMap<String, FieldSelection>),
    /// Every field of the enclosing relation.
    All,
}

impl From<&str> for FieldSelection {
    fn from(name: &str) -> Self {
        FieldSelection::Names(vec![name.to_string()])
    }
}

impl From<Vec<&str>> for FieldSelection {
    fn from(names: Vec<&str>) -> Self {
        FieldSelection::Names(names.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for FieldSelection {
    fn from(names: Vec<String>) -> Self {
        FieldSelection::Names(names)
    }
}

static EMPTY: ExcludableSet = ExcludableSet {
    include: None,
    exclude: BTreeSet::new(),
    required: BTreeSet::new(),
    children: BTreeMap::new(),
};

/// Include/exclude sets for one entity, with one child per relation named.
///
/// No include set means every field is visible. Exclude narrows further and
/// wins over include. Required fields (the primary key, and keys the engine
/// needs to stitch prefetched relations) are visible regardless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludableSet {
    include: Option<BTreeSet<String>>,
    exclude: BTreeSet<String>,
    required: BTreeSet<String>,
    children: BTreeMap<String, ExcludableSet>,
}

impl ExcludableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate `selection` for `entity`. Repeated calls union.
    pub fn build(
        &mut self,
        schema: &Schema,
        entity: EntityId,
        selection: &FieldSelection,
        is_exclude: bool,
    ) -> QueryResult<()> {
        self.required.insert(schema.entity(entity).pk.clone());
        match selection {
            FieldSelection::All => Ok(()),
            FieldSelection::Names(names) => {
                for name in names {
                    let parts = RelationPath::parse(name);
                    self.add_path(schema, entity, name, parts.segments(), is_exclude)?;
                }
                Ok(())
            }
            FieldSelection::Tree(entries) => {
                for (key, sub) in entries {
                    match sub {
                        FieldSelection::All => {
                            self.add_path(schema, entity, key, &[key.clone()], is_exclude)?
                        }
                        nested => {
                            let rel_id = schema
                                .find_relation(entity, key)
                                .ok_or_else(|| QueryError::unknown_relation(key.clone(), key.clone()))?;
                            let target = schema.relation(rel_id).target;
                            self.child_mut(schema, target, key)
                                .build(schema, target, nested, is_exclude)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn add_path(
        &mut self,
        schema: &Schema,
        entity: EntityId,
        raw: &str,
        parts: &[String],
        is_exclude: bool,
    ) -> QueryResult<()> {
        let Some((head, rest)) = parts.split_first() else {
            return Ok(());
        };
        let ty = schema.entity(entity);

        if !rest.is_empty() {
            let rel_id = schema
                .find_relation(entity, head)
                .ok_or_else(|| QueryError::unknown_relation(raw, head.clone()))?;
            let target = schema.relation(rel_id).target;
            return self
                .child_mut(schema, target, head)
                .add_path(schema, target, raw, rest, is_exclude);
        }

        let name = if head == PK_ALIAS {
            ty.pk.clone()
        } else if ty.has_field(head) || schema.find_relation(entity, head).is_some() {
            head.clone()
        } else {
            return Err(QueryError::unknown_field(&ty.name, head));
        };

        if is_exclude {
            self.exclude.insert(name);
        } else {
            self.include.get_or_insert_with(BTreeSet::new).insert(name);
        }
        Ok(())
    }

    fn child_mut(&mut self, schema: &Schema, target: EntityId, relation: &str) -> &mut ExcludableSet {
        let child = self.children.entry(relation.to_string()).or_default();
        child.required.insert(schema.entity(target).pk.clone());
        child
    }

    pub fn is_included(&self, field: &str) -> bool {
        if self.required.contains(field) {
            return true;
        }
        if self.exclude.contains(field) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| set.contains(field))
    }

    pub fn is_excluded(&self, field: &str) -> bool {
        !self.is_included(field)
    }

    /// True if the whole relation was excluded.
    pub fn is_relation_excluded(&self, relation: &str) -> bool {
        self.exclude.contains(relation)
    }

    /// True if `path`, or any relation along it, was excluded.
    pub fn excludes_path(&self, path: &RelationPath) -> bool {
        let mut node = self;
        for segment in path.segments() {
            if node.is_relation_excluded(segment) {
                return true;
            }
            node = node.get_child(segment);
        }
        false
    }

    /// Set for a related entity; an empty set if nothing was said about it.
    pub fn get_child(&self, relation: &str) -> &ExcludableSet {
        self.children.get(relation).unwrap_or(&EMPTY)
    }

    /// Set at the end of `path`.
    pub fn at(&self, path: &RelationPath) -> &ExcludableSet {
        path.segments()
            .iter()
            .fold(self, |node, segment| node.get_child(segment))
    }

    /// Force `field` visible at `path` regardless of user input.
    pub fn require(&mut self, path: &RelationPath, field: &str) {
        let mut node = self;
        for segment in path.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        node.required.insert(field.to_string());
    }

    /// Reject projections that would hide a non-nullable column of any
    /// entity the query materializes. `paths` are the joined relation paths.
    pub fn check_required<'p>(
        &self,
        schema: &Schema,
        root: EntityId,
        paths: impl IntoIterator<Item = (&'p RelationPath, EntityId)>,
    ) -> QueryResult<()> {
        self.check_entity(schema, root)?;
        for (path, entity) in paths {
            self.at(path).check_entity(schema, entity)?;
        }
        Ok(())
    }

    fn check_entity(&self, schema: &Schema, entity: EntityId) -> QueryResult<()> {
        let ty = schema.entity(entity);
        match ty
            .columns
            .iter()
            .find(|c| !c.nullable && c.name != ty.pk && self.is_excluded(&c.name))
        {
            Some(column) => Err(QueryError::ExcludedRequiredField {
                entity: ty.name.clone(),
                field: column.name.clone(),
            }),
            None => Ok(()),
        }
    }
}
