//! Entity-relation schema.
//!
//! Entity types live in an arena (`petgraph::DiGraph`) and are referenced by
//! [`EntityId`]; relations are the graph's edges, referenced by [`RelationId`].
//! Every forward edge has a mirror edge pointing back.

mod builder;
mod entity;
mod relation;

use std::collections::HashMap;
use std::fmt;

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};

pub use builder::{EntityDef, RelationDef, SchemaBuilder};
pub use entity::{Column, EntityType};
pub use relation::{Relation, RelationKind};

use crate::error::{SchemaError, SchemaResult};

/// Stable handle to an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) NodeIndex);

/// Stable handle to a relation edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub(crate) EdgeIndex);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0.index())
    }
}

/// An immutable, fully resolved schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub(crate) graph: DiGraph<EntityType, Relation>,
    pub(crate) node_indices: HashMap<String, NodeIndex>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Entity by id. Ids are only minted by this schema.
    pub fn entity(&self, id: EntityId) -> &EntityType {
        &self.graph[id.0]
    }

    pub fn entity_id(&self, name: &str) -> SchemaResult<EntityId> {
        self.node_indices
            .get(name)
            .copied()
            .map(EntityId)
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
    }

    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.graph[id.0]
    }

    pub fn find_relation(&self, entity: EntityId, name: &str) -> Option<RelationId> {
        self.entity(entity).relation(name)
    }

    /// Relations of an entity in declaration order.
    pub fn relations_of(&self, entity: EntityId) -> impl Iterator<Item = (RelationId, &Relation)> {
        self.entity(entity)
            .relations()
            .iter()
            .map(move |id| (*id, self.relation(*id)))
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &EntityType)> {
        self.graph
            .node_indices()
            .map(move |idx| (EntityId(idx), &self.graph[idx]))
    }
}
