//! Relation descriptors (graph edges).

use super::{EntityId, RelationId};

/// Kind of relation edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Owner holds a key column pointing at the target's primary key.
    ForeignKey,
    /// Mirror of a foreign key: target holds the key column pointing back.
    ReverseForeignKey,
    /// Through-entity with one key column per side.
    ManyToMany,
}

/// One edge of the entity graph.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub owner: EntityId,
    pub target: EntityId,
    /// Through-entity for many-to-many relations.
    pub through: Option<EntityId>,
    /// Key field carrying the link.
    ///
    /// - ForeignKey: field on the owner
    /// - ReverseForeignKey: field on the target
    /// - ManyToMany: field on the through-entity pointing at the owner
    pub key_field: String,
    /// ManyToMany only: field on the through-entity pointing at the target.
    pub target_key_field: Option<String>,
    pub nullable: bool,
    /// Mirror edges are virtual: declared implicitly by their forward edge.
    pub is_virtual: bool,
    pub related_name: Option<String>,
    pub(crate) mirror: Option<RelationId>,
}

impl Relation {
    /// Does following this edge fan out rows?
    pub fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::ReverseForeignKey | RelationKind::ManyToMany
        )
    }

    pub fn is_self_reference(&self) -> bool {
        self.owner == self.target
    }

    /// The edge on the target pointing back at the owner.
    pub fn mirror(&self) -> Option<RelationId> {
        self.mirror
    }
}
