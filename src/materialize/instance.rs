//! Materialized entity instances and the factory that builds them.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::ConstructError;
use crate::schema::{EntityId, EntityType, Schema};
use crate::value::Value;

static NULL: Value = Value::Null;

/// A loaded relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Related {
    /// To-one relation; `None` when the row had no related entity.
    One(Option<Box<Instance>>),
    /// To-many or many-to-many relation.
    Many(Vec<Instance>),
}

impl Related {
    pub fn instances(&self) -> Vec<&Instance> {
        match self {
            Related::One(one) => one.iter().map(|b| b.as_ref()).collect(),
            Related::Many(many) => many.iter().collect(),
        }
    }

    pub(crate) fn instances_mut(&mut self) -> Vec<&mut Instance> {
        match self {
            Related::One(one) => one.iter_mut().map(|b| b.as_mut()).collect(),
            Related::Many(many) => many.iter_mut().collect(),
        }
    }
}

/// One reconstructed entity.
///
/// A relation missing from `relations` was not loaded; that is distinct from
/// a loaded to-one relation holding `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    entity: EntityId,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) relations: BTreeMap<String, Related>,
}

impl Instance {
    pub fn new(entity: EntityId, fields: BTreeMap<String, Value>) -> Self {
        Self {
            entity,
            fields,
            relations: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Primary-key value, `Null` if absent.
    pub fn pk(&self, schema: &Schema) -> &Value {
        self.fields
            .get(&schema.entity(self.entity).pk)
            .unwrap_or(&NULL)
    }

    pub fn is_loaded(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub fn related(&self, relation: &str) -> Option<&Related> {
        self.relations.get(relation)
    }

    /// A loaded to-one relation's instance.
    pub fn one(&self, relation: &str) -> Option<&Instance> {
        match self.relations.get(relation) {
            Some(Related::One(Some(inst))) => Some(inst.as_ref()),
            _ => None,
        }
    }

    /// A loaded to-many relation's instances; empty when not loaded.
    pub fn many(&self, relation: &str) -> &[Instance] {
        match self.relations.get(relation) {
            Some(Related::Many(items)) => items,
            _ => &[],
        }
    }

    pub fn relations(&self) -> &BTreeMap<String, Related> {
        &self.relations
    }

    pub fn set_related(&mut self, relation: impl Into<String>, related: Related) {
        self.relations.insert(relation.into(), related);
    }

    pub(crate) fn related_mut(&mut self, relation: &str) -> Option<&mut Related> {
        self.relations.get_mut(relation)
    }

    pub(crate) fn take_related(&mut self, relation: &str) -> Option<Related> {
        self.relations.remove(relation)
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl Serialize for Instance {
    /// Fields first, then loaded relations.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + self.relations.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        for (name, related) in &self.relations {
            map.serialize_entry(name, related)?;
        }
        map.end()
    }
}

/// Builds instances from field values.
///
/// The engine never validates values itself; it asks the factory to, except
/// for partially populated stubs where `skip_validation` is set.
pub trait InstanceFactory: Send + Sync {
    fn construct(
        &self,
        entity: &EntityType,
        id: EntityId,
        values: BTreeMap<String, Value>,
        skip_validation: bool,
    ) -> Result<Instance, ConstructError>;
}

/// Factory that only checks non-nullable columns are present.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl InstanceFactory for DefaultFactory {
    fn construct(
        &self,
        entity: &EntityType,
        id: EntityId,
        values: BTreeMap<String, Value>,
        skip_validation: bool,
    ) -> Result<Instance, ConstructError> {
        if !skip_validation {
            if let Some(column) = entity
                .columns
                .iter()
                .find(|c| !c.nullable && values.get(&c.name).map_or(true, Value::is_null))
            {
                return Err(ConstructError::MissingField {
                    entity: entity.name.clone(),
                    field: column.name.clone(),
                });
            }
        }
        Ok(Instance::new(id, values))
    }
}
