//! Relation paths, lookups and their resolution against the schema.
//!
//! A lookup such as `author__name__icontains` is a chain of relation names,
//! a field and an optional operator. Segments are separated by `__`; `.` is
//! accepted as well.

use std::fmt;

use crate::error::{QueryError, QueryResult};
use crate::schema::{EntityId, RelationId, RelationKind, Schema};

/// Field name accepted everywhere as a synonym for the primary key.
pub const PK_ALIAS: &str = "pk";

fn split_segments(raw: &str) -> Vec<String> {
    raw.split("__")
        .flat_map(|part| part.split('.'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A chain of relation names starting at a root entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationPath(Vec<String>);

impl RelationPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        Self(split_segments(raw))
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Path without its last segment.
    pub fn parent(&self) -> Option<RelationPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn child(&self, segment: &str) -> RelationPath {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &RelationPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// `other` with this path removed from its front.
    pub fn strip_from(&self, other: &RelationPath) -> Option<RelationPath> {
        self.is_prefix_of(other)
            .then(|| Self(other.0[self.0.len()..].to_vec()))
    }

    /// Every non-empty prefix, shortest first, ending with the path itself.
    pub fn prefixes(&self) -> impl Iterator<Item = RelationPath> + '_ {
        (1..=self.0.len()).map(move |n| Self(self.0[..n].to_vec()))
    }
}

impl fmt::Display for RelationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("__"))
    }
}

impl From<&str> for RelationPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// Comparison operator at the end of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IsNull,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "isnull" => Self::IsNull,
            "in" => Self::In,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::IsNull => "isnull",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }

    /// Operators compiled to LIKE.
    pub fn is_like(&self) -> bool {
        matches!(
            self,
            Self::Contains
                | Self::IContains
                | Self::StartsWith
                | Self::IStartsWith
                | Self::EndsWith
                | Self::IEndsWith
        )
    }

    pub fn is_case_insensitive(&self) -> bool {
        matches!(
            self,
            Self::IExact | Self::IContains | Self::IStartsWith | Self::IEndsWith
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed lookup key: field segments and operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    raw: String,
    pub parts: Vec<String>,
    pub operator: Operator,
}

impl Lookup {
    /// Split `raw` into field segments and an operator (default `exact`).
    ///
    /// A trailing segment is read as an operator only when a field segment
    /// precedes it.
    pub fn parse(raw: &str) -> Self {
        let mut parts = split_segments(raw);
        let operator = match parts.last().and_then(|p| Operator::parse(p)) {
            Some(op) if parts.len() > 1 => {
                parts.pop();
                op
            }
            _ => Operator::Exact,
        };
        Self {
            raw: raw.to_string(),
            parts,
            operator,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An ordering request such as `-author__name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub parts: Vec<String>,
    pub descending: bool,
}

impl OrderSpec {
    pub fn parse(raw: &str) -> Self {
        let (descending, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        Self {
            parts: split_segments(body),
            descending,
        }
    }

    pub fn asc(raw: &str) -> Self {
        Self {
            parts: split_segments(raw),
            descending: false,
        }
    }

    pub fn desc(raw: &str) -> Self {
        Self {
            parts: split_segments(raw),
            descending: true,
        }
    }

    pub fn raw(&self) -> String {
        format!(
            "{}{}",
            if self.descending { "-" } else { "" },
            self.parts.join("__")
        )
    }
}

impl From<&str> for OrderSpec {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// A relation path walked against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: RelationPath,
    /// Relation edges in order, one per segment.
    pub hops: Vec<RelationId>,
    /// Entity at the end of the path.
    pub target: EntityId,
    /// True if any hop goes through a many-to-many through-table.
    pub passes_through: bool,
}

impl ResolvedPath {
    /// Last hop. Only call on non-root paths.
    pub fn last_relation(&self) -> RelationId {
        self.hops[self.hops.len() - 1]
    }
}

/// What the last segment of a lookup names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'s> {
    /// A column, by field name.
    Column(&'s str),
    /// A relation used as a field.
    Relation(RelationId),
}

/// A lookup's field resolved to the entity it lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTarget<'s> {
    /// Relations walked before the field.
    pub path: RelationPath,
    pub entity: EntityId,
    pub field: FieldRef<'s>,
}

impl FieldTarget<'_> {
    /// Relation path that must be joined to reach the column this field
    /// compiles to, and the column's field name.
    ///
    /// A foreign key used as a field reads its key column on the owner; a
    /// to-many relation used as a field reads the target's primary key.
    pub fn column_path<'a>(&'a self, schema: &'a Schema) -> (RelationPath, EntityId, &'a str) {
        match self.field {
            FieldRef::Column(name) => (self.path.clone(), self.entity, name),
            FieldRef::Relation(rel_id) => {
                let rel = schema.relation(rel_id);
                match rel.kind {
                    RelationKind::ForeignKey => (self.path.clone(), self.entity, &rel.key_field),
                    _ => (
                        self.path.child(&rel.name),
                        rel.target,
                        &schema.entity(rel.target).pk,
                    ),
                }
            }
        }
    }
}

/// Walks relation paths from a root entity.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'s> {
    schema: &'s Schema,
    root: EntityId,
}

impl<'s> Resolver<'s> {
    pub fn new(schema: &'s Schema, root: EntityId) -> Self {
        Self { schema, root }
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    /// Walk a path made only of relation names.
    pub fn resolve(&self, path: &RelationPath) -> QueryResult<ResolvedPath> {
        let mut entity = self.root;
        let mut hops = Vec::with_capacity(path.len());
        let mut passes_through = false;

        for segment in path.segments() {
            let rel_id = self
                .schema
                .find_relation(entity, segment)
                .ok_or_else(|| QueryError::unknown_relation(path.to_string(), segment.clone()))?;
            let rel = self.schema.relation(rel_id);
            passes_through |= rel.kind == RelationKind::ManyToMany;
            hops.push(rel_id);
            entity = rel.target;
        }

        Ok(ResolvedPath {
            path: path.clone(),
            hops,
            target: entity,
            passes_through,
        })
    }

    /// Resolve the field segments of a lookup or ordering.
    ///
    /// Relations are consumed greedily; a relation in last position is a
    /// relation used as a field. `pk` names the primary key.
    pub fn resolve_field(&self, lookup: &str, parts: &[String]) -> QueryResult<FieldTarget<'s>> {
        let mut entity = self.root;
        let mut walked = Vec::new();

        for (idx, segment) in parts.iter().enumerate() {
            let is_last = idx + 1 == parts.len();
            let ty = self.schema.entity(entity);

            if let Some(rel_id) = self.schema.find_relation(entity, segment) {
                if is_last {
                    return Ok(FieldTarget {
                        path: RelationPath::from_segments(walked),
                        entity,
                        field: FieldRef::Relation(rel_id),
                    });
                }
                walked.push(segment.clone());
                entity = self.schema.relation(rel_id).target;
                continue;
            }

            let column = if segment == PK_ALIAS {
                Some(ty.pk_column())
            } else {
                ty.column(segment)
            };
            match column {
                Some(column) if is_last => {
                    return Ok(FieldTarget {
                        path: RelationPath::from_segments(walked),
                        entity,
                        field: FieldRef::Column(&column.name),
                    });
                }
                Some(_) => {
                    return Err(QueryError::UnknownOperator {
                        lookup: lookup.to_string(),
                        operator: parts[idx + 1..].join("__"),
                    });
                }
                None if is_last => return Err(QueryError::unknown_field(&ty.name, segment)),
                None => return Err(QueryError::unknown_relation(parts.join("__"), segment)),
            }
        }

        // Empty lookup: the root primary key.
        let ty = self.schema.entity(self.root);
        Err(QueryError::unknown_field(&ty.name, lookup))
    }
}
