//! Schema construction.
//!
//! Entities and relations are declared by name, so a relation may point at
//! its own entity or at one declared later. Names resolve in [`SchemaBuilder::build`].

use std::collections::HashMap;

use petgraph::graph::DiGraph;

use super::entity::{Column, EntityType};
use super::relation::{Relation, RelationKind};
use super::{EntityId, RelationId, Schema};
use crate::error::{SchemaError, SchemaResult};

/// Declaration of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDef {
    name: String,
    table: String,
    pk: Option<String>,
    columns: Vec<Column>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            pk: None,
            columns: Vec::new(),
        }
    }

    /// Declare the primary key, adding the column if not yet present.
    pub fn with_pk(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.columns.iter().any(|c| c.name == field) {
            self.columns.insert(0, Column::new(field.clone()));
        }
        self.pk = Some(field);
        self
    }

    /// Add a required column.
    pub fn with_column(self, field: impl Into<String>) -> Self {
        self.with(Column::new(field))
    }

    /// Add a nullable column.
    pub fn with_nullable_column(self, field: impl Into<String>) -> Self {
        self.with(Column::new(field).nullable())
    }

    /// Add a fully specified column.
    pub fn with(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }
}

/// Declaration of a forward relation. Its mirror is created automatically.
#[derive(Debug, Clone)]
pub struct RelationDef {
    owner: String,
    name: String,
    target: String,
    kind: RelationKind,
    through: Option<String>,
    key_field: String,
    target_key_field: Option<String>,
    nullable: bool,
    related_name: Option<String>,
}

impl RelationDef {
    /// `owner.name -> target`, with `key_field` on the owner.
    pub fn foreign_key(
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ForeignKey,
            through: None,
            key_field: key_field.into(),
            target_key_field: None,
            nullable: true,
            related_name: None,
        }
    }

    /// `owner.name <-> target` through `through`, whose `owner_field` points at
    /// the owner and `target_field` at the target.
    pub fn many_to_many(
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        owner_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ManyToMany,
            through: Some(through.into()),
            key_field: owner_field.into(),
            target_key_field: Some(target_field.into()),
            nullable: true,
            related_name: None,
        }
    }

    /// Name of the mirror relation on the target.
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Mark a foreign key as required.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Builds an immutable [`Schema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityDef>,
    relations: Vec<RelationDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    pub fn relation(mut self, def: RelationDef) -> Self {
        self.relations.push(def);
        self
    }

    /// Resolve names and create mirror edges.
    ///
    /// Phase 1 adds every entity node, phase 2 adds forward edges with their
    /// mirrors, so forward and self references need no special handling.
    pub fn build(self) -> SchemaResult<Schema> {
        let mut graph: DiGraph<EntityType, Relation> = DiGraph::new();
        let mut node_indices = HashMap::new();

        // Phase 1: entities
        for def in self.entities {
            if node_indices.contains_key(&def.name) {
                return Err(SchemaError::DuplicateEntity(def.name));
            }
            let pk = def
                .pk
                .ok_or_else(|| SchemaError::MissingPrimaryKey(def.name.clone()))?;
            let name = def.name.clone();
            let idx = graph.add_node(EntityType::new(def.name, def.table, pk, def.columns));
            node_indices.insert(name, idx);
        }

        let lookup = |name: &str| -> SchemaResult<EntityId> {
            node_indices
                .get(name)
                .copied()
                .map(EntityId)
                .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
        };

        // Phase 2: relations and their mirrors
        for def in self.relations {
            let owner = lookup(&def.owner)?;
            let target = lookup(&def.target)?;
            let through = def.through.as_deref().map(&lookup).transpose()?;

            match def.kind {
                RelationKind::ForeignKey => {
                    require_column(&graph[owner.0], &def.key_field)?;
                }
                _ => {
                    let through_entity = &graph[through.unwrap_or(owner).0];
                    require_column(through_entity, &def.key_field)?;
                    if let Some(field) = &def.target_key_field {
                        require_column(through_entity, field)?;
                    }
                }
            }

            let mirror_name = def
                .related_name
                .clone()
                .unwrap_or_else(|| format!("{}s", graph[owner.0].name.to_lowercase()));

            let forward = Relation {
                name: def.name.clone(),
                kind: def.kind,
                owner,
                target,
                through,
                key_field: def.key_field.clone(),
                target_key_field: def.target_key_field.clone(),
                nullable: def.nullable,
                is_virtual: false,
                related_name: def.related_name.clone(),
                mirror: None,
            };
            let forward_id = add_relation(&mut graph, forward)?;

            let mirror = match def.kind {
                RelationKind::ForeignKey => Relation {
                    name: mirror_name,
                    kind: RelationKind::ReverseForeignKey,
                    owner: target,
                    target: owner,
                    through: None,
                    key_field: def.key_field,
                    target_key_field: None,
                    nullable: true,
                    is_virtual: true,
                    related_name: Some(def.name),
                    mirror: Some(forward_id),
                },
                _ => Relation {
                    name: mirror_name,
                    kind: RelationKind::ManyToMany,
                    owner: target,
                    target: owner,
                    through,
                    key_field: def.target_key_field.unwrap_or_default(),
                    target_key_field: Some(def.key_field),
                    nullable: true,
                    is_virtual: true,
                    related_name: Some(def.name),
                    mirror: Some(forward_id),
                },
            };
            let mirror_id = add_relation(&mut graph, mirror)?;
            graph[forward_id.0].mirror = Some(mirror_id);
        }

        Ok(Schema {
            graph,
            node_indices,
        })
    }
}

fn require_column(entity: &EntityType, field: &str) -> SchemaResult<()> {
    if entity.has_field(field) {
        Ok(())
    } else {
        Err(SchemaError::UnknownColumn {
            entity: entity.name.clone(),
            column: field.to_string(),
        })
    }
}

/// Add an edge, rejecting a name already used by a relation or column of the owner.
fn add_relation(
    graph: &mut DiGraph<EntityType, Relation>,
    relation: Relation,
) -> SchemaResult<RelationId> {
    let owner = &graph[relation.owner.0];
    if owner.relation_names.contains_key(&relation.name) || owner.has_field(&relation.name) {
        return Err(SchemaError::DuplicateRelation {
            entity: owner.name.clone(),
            relation: relation.name,
        });
    }

    let (from, to, name) = (relation.owner, relation.target, relation.name.clone());
    let id = RelationId(graph.add_edge(from.0, to.0, relation));
    let owner = &mut graph[from.0];
    owner.relations.push(id);
    owner.relation_names.insert(name, id);
    Ok(id)
}
