//! Deduplication of instances repeated by join fan-out.

use std::collections::HashMap;

use crate::schema::{EntityId, Schema};
use crate::value::Value;

use super::instance::{Instance, Related};

/// Merges instances sharing a primary key.
pub struct MergeEngine<'a> {
    schema: &'a Schema,
}

impl<'a> MergeEngine<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// One instance per distinct (entity, primary key), in order of first
    /// appearance, with child collections unioned and deduplicated at every
    /// level.
    pub fn merge(&self, instances: Vec<Instance>) -> Vec<Instance> {
        let mut index: HashMap<(EntityId, Value), usize> = HashMap::new();
        let mut groups: Vec<Vec<Instance>> = Vec::new();

        for instance in instances {
            let key = (instance.entity(), instance.pk(self.schema).clone());
            match index.get(&key) {
                Some(&slot) => groups[slot].push(instance),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![instance]);
                }
            }
        }

        groups
            .into_iter()
            .filter_map(|group| self.reduce(group))
            .map(|instance| self.normalize(instance))
            .collect()
    }

    /// Merge adjacent pairs until one instance is left.
    fn reduce(&self, mut group: Vec<Instance>) -> Option<Instance> {
        while group.len() > 1 {
            let mut next = Vec::with_capacity(group.len().div_ceil(2));
            let mut items = group.into_iter();
            while let Some(a) = items.next() {
                next.push(match items.next() {
                    Some(b) => self.merge_pair(a, b),
                    None => a,
                });
            }
            group = next;
        }
        group.pop()
    }

    fn merge_pair(&self, mut a: Instance, b: Instance) -> Instance {
        for (name, value) in b.fields {
            match a.fields.get_mut(&name) {
                Some(existing) if existing.is_null() => *existing = value,
                Some(_) => {}
                None => {
                    a.fields.insert(name, value);
                }
            }
        }
        for (name, theirs) in b.relations {
            let merged = match a.relations.remove(&name) {
                Some(ours) => self.merge_related(ours, theirs),
                None => theirs,
            };
            a.relations.insert(name, merged);
        }
        a
    }

    /// Concatenate to-many lists; `normalize` dedupes them afterwards.
    fn merge_related(&self, ours: Related, theirs: Related) -> Related {
        match (ours, theirs) {
            (Related::Many(mut left), Related::Many(right)) => {
                left.extend(right);
                Related::Many(left)
            }
            (Related::One(Some(left)), Related::One(Some(right))) => {
                if left.entity() == right.entity() && left.pk(self.schema) == right.pk(self.schema)
                {
                    Related::One(Some(Box::new(self.merge_pair(*left, *right))))
                } else {
                    Related::One(Some(left))
                }
            }
            (Related::One(None), theirs) => theirs,
            (ours, _) => ours,
        }
    }

    /// Deduplicate every child collection, recursively.
    fn normalize(&self, mut instance: Instance) -> Instance {
        let relations = std::mem::take(&mut instance.relations);
        instance.relations = relations
            .into_iter()
            .map(|(name, related)| {
                let related = match related {
                    Related::Many(items) => Related::Many(self.merge(items)),
                    Related::One(Some(one)) => Related::One(Some(Box::new(self.normalize(*one)))),
                    Related::One(None) => Related::One(None),
                };
                (name, related)
            })
            .collect();
        instance
    }
}
