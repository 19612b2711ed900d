//! Flat result rows to instance trees.

use std::collections::{BTreeMap, HashMap};

use crate::error::QueryResult;
use crate::planner::{JoinNode, JoinTree, SelectedColumn};
use crate::schema::{EntityId, RelationKind, Schema};
use crate::value::Value;

use super::instance::{Instance, InstanceFactory, Related};

/// One backend row: column label to value.
pub type ResultRow = HashMap<String, Value>;

/// Slices rows along a [`JoinTree`].
pub struct RowMaterializer<'a> {
    schema: &'a Schema,
    factory: &'a dyn InstanceFactory,
}

impl<'a> RowMaterializer<'a> {
    pub fn new(schema: &'a Schema, factory: &'a dyn InstanceFactory) -> Self {
        Self { schema, factory }
    }

    /// One root instance per row, duplicates included.
    pub fn materialize(&self, rows: &[ResultRow], tree: &JoinTree) -> QueryResult<Vec<Instance>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(instance) = self.from_row(row, tree)? {
                out.push(instance);
            }
        }
        Ok(out)
    }

    /// Root instance of one row; `None` if its primary key is null.
    pub fn from_row(&self, row: &ResultRow, tree: &JoinTree) -> QueryResult<Option<Instance>> {
        self.build(row, tree.root, &tree.columns, &tree.children, false)
    }

    fn build(
        &self,
        row: &ResultRow,
        entity: EntityId,
        columns: &[SelectedColumn],
        children: &[JoinNode],
        partial: bool,
    ) -> QueryResult<Option<Instance>> {
        let ty = self.schema.entity(entity);
        let pk_present = columns
            .iter()
            .find(|c| c.field == ty.pk)
            .and_then(|c| row.get(&c.label))
            .is_some_and(|v| !v.is_null());
        if !pk_present {
            return Ok(None);
        }

        let mut relations = BTreeMap::new();
        for child in children {
            let instance =
                self.build(row, child.target, &child.columns, &child.children, child.partial)?;
            let related = if child.to_many {
                Related::Many(instance.into_iter().collect())
            } else {
                Related::One(instance.map(Box::new))
            };
            relations.insert(child.name.clone(), related);
        }

        let values: BTreeMap<String, Value> = ty
            .columns
            .iter()
            .map(|c| {
                let value = columns
                    .iter()
                    .find(|s| s.field == c.name)
                    .and_then(|s| row.get(&s.label))
                    .cloned()
                    .unwrap_or_default();
                (c.name.clone(), value)
            })
            .collect();

        let mut instance = self.factory.construct(ty, entity, values, partial)?;

        // Unloaded foreign keys become stubs holding the target's key.
        for (_, rel) in self.schema.relations_of(entity) {
            if rel.kind != RelationKind::ForeignKey || relations.contains_key(&rel.name) {
                continue;
            }
            if !columns.iter().any(|c| c.field == rel.key_field) {
                continue;
            }
            let related = match instance.get(&rel.key_field) {
                Some(key) if !key.is_null() => {
                    let target = self.schema.entity(rel.target);
                    let mut stub_values = BTreeMap::new();
                    stub_values.insert(target.pk.clone(), key.clone());
                    let stub = self
                        .factory
                        .construct(target, rel.target, stub_values, true)?;
                    Related::One(Some(Box::new(stub)))
                }
                _ => Related::One(None),
            };
            relations.insert(rel.name.clone(), related);
        }

        instance.relations = relations;
        Ok(Some(instance))
    }
}
