//! Table alias assignment.
//!
//! Every relation edge gets one short alias for the lifetime of the registry,
//! so the labels embedded in compiled SQL are reproducible across queries.
//! When one query reaches the same edge through two different paths (self
//! references, diamonds) the extra paths get aliases scoped to the full path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::config::{MAX_ALIAS_LENGTH, MIN_ALIAS_LENGTH};
use crate::error::{QueryError, QueryResult};
use crate::path::{RelationPath, ResolvedPath};
use crate::schema::{RelationKind, Schema};

/// A short table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Alias(String);

impl Alias {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Column label for `field` read through this alias.
    pub fn label(&self, field: &str) -> String {
        format!("{}_{}", self.0, field)
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an alias is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AliasScope {
    /// Target side of a relation edge, keyed by owner table and relation name.
    Edge { table: String, relation: String },
    /// Through-table of a many-to-many edge.
    Through { table: String, relation: String },
    /// Target of a full relation path from a root table.
    Path { root: String, path: String },
    /// Through-table reached by a full relation path.
    ThroughPath { root: String, path: String },
}

impl AliasScope {
    fn key(&self) -> String {
        match self {
            AliasScope::Edge { table, relation } => format!("edge:{}.{}", table, relation),
            AliasScope::Through { table, relation } => format!("through:{}.{}", table, relation),
            AliasScope::Path { root, path } => format!("path:{}:{}", root, path),
            AliasScope::ThroughPath { root, path } => format!("through-path:{}:{}", root, path),
        }
    }
}

/// Process-lifetime alias store.
///
/// Append-only and safe to share behind an `Arc`; registration of a scope is
/// serialized by the map's entry lock.
#[derive(Debug)]
pub struct AliasRegistry {
    length: usize,
    by_scope: DashMap<AliasScope, Alias>,
    taken: DashMap<Alias, AliasScope>,
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::new(6)
    }
}

impl AliasRegistry {
    /// Registry minting aliases of `length` hex characters (clamped to 4..=16).
    pub fn new(length: usize) -> Self {
        Self {
            length: length.clamp(MIN_ALIAS_LENGTH, MAX_ALIAS_LENGTH),
            by_scope: DashMap::new(),
            taken: DashMap::new(),
        }
    }

    /// Alias for `scope`, minting one on first use.
    pub fn register(&self, scope: AliasScope) -> Alias {
        match self.by_scope.entry(scope) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let alias = self.mint(slot.key());
                tracing::trace!(scope = %slot.key().key(), alias = %alias, "alias minted");
                slot.insert(alias.clone());
                alias
            }
        }
    }

    /// Alias for `scope` if it was registered.
    pub fn resolve(&self, scope: &AliasScope) -> Option<Alias> {
        self.by_scope.get(scope).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.by_scope.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scope.is_empty()
    }

    fn mint(&self, scope: &AliasScope) -> Alias {
        let key = scope.key();
        let mut attempt = 0u32;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            if attempt > 0 {
                hasher.update(attempt.to_le_bytes());
            }
            let digest = format!("{:x}", hasher.finalize());
            let candidate = Alias(digest[..self.length].to_string());

            match self.taken.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(scope.clone());
                    return candidate;
                }
                Entry::Occupied(owner) if owner.get() == scope => {
                    return candidate;
                }
                Entry::Occupied(_) => attempt += 1,
            }
        }
    }
}

/// Aliases of one joined path: its target and, for many-to-many, its through-table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAlias {
    pub target: Alias,
    pub through: Option<Alias>,
}

/// Per-query alias assignment for every joined path.
#[derive(Debug, Clone, Default)]
pub struct AliasPlan {
    entries: BTreeMap<String, JoinAlias>,
}

impl AliasPlan {
    /// Assign aliases to `paths`, which must be prefix-closed and resolved
    /// from the same root.
    ///
    /// Paths ending on the same edge collide. Within a colliding group the
    /// shortest path (earliest declared on ties) keeps the edge alias and the
    /// others get path-scoped aliases, minted longest first.
    pub fn assign(
        registry: &AliasRegistry,
        schema: &Schema,
        root_table: &str,
        paths: &[ResolvedPath],
    ) -> QueryResult<Self> {
        let mut groups: HashMap<AliasScope, Vec<usize>> = HashMap::new();
        let mut group_order = Vec::new();
        for (idx, resolved) in paths.iter().enumerate() {
            let Some(last) = resolved.hops.last() else {
                continue;
            };
            let rel = schema.relation(*last);
            let scope = AliasScope::Edge {
                table: schema.entity(rel.owner).table.clone(),
                relation: rel.name.clone(),
            };
            let group = groups.entry(scope.clone()).or_default();
            if group.is_empty() {
                group_order.push(scope);
            }
            group.push(idx);
        }

        let mut plan = AliasPlan::default();
        for scope in group_order {
            let mut members = groups.remove(&scope).unwrap_or_default();
            members.sort_by(|a, b| {
                paths[*b]
                    .path
                    .len()
                    .cmp(&paths[*a].path.len())
                    .then(b.cmp(a))
            });
            let keeper = members.pop();

            for idx in members {
                let resolved = &paths[idx];
                let key = resolved.path.to_string();
                let rel = schema.relation(resolved.last_relation());
                let through = (rel.kind == RelationKind::ManyToMany).then(|| {
                    registry.register(AliasScope::ThroughPath {
                        root: root_table.to_string(),
                        path: key.clone(),
                    })
                });
                let target = registry.register(AliasScope::Path {
                    root: root_table.to_string(),
                    path: key.clone(),
                });
                tracing::trace!(path = %key, alias = %target, "path-scoped alias");
                plan.entries.insert(key, JoinAlias { target, through });
            }

            if let Some(idx) = keeper {
                let resolved = &paths[idx];
                let rel = schema.relation(resolved.last_relation());
                let table = schema.entity(rel.owner).table.clone();
                let through = (rel.kind == RelationKind::ManyToMany).then(|| {
                    registry.register(AliasScope::Through {
                        table: table.clone(),
                        relation: rel.name.clone(),
                    })
                });
                let target = registry.register(scope);
                plan.entries
                    .insert(resolved.path.to_string(), JoinAlias { target, through });
            }
        }

        plan.verify_unique(root_table)?;
        Ok(plan)
    }

    pub fn get(&self, path: &RelationPath) -> Option<&JoinAlias> {
        self.entries.get(&path.to_string())
    }

    /// Table qualifier for columns read at `path`: `root` for the root entity,
    /// the join alias otherwise.
    pub fn qualifier<'a>(&'a self, path: &RelationPath, root: &'a str) -> QueryResult<&'a str> {
        if path.is_empty() {
            return Ok(root);
        }
        self.get(path)
            .map(|ja| ja.target.as_str())
            .ok_or_else(|| {
                QueryError::unknown_relation(path.to_string(), path.last().unwrap_or_default())
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every alias in the statement must name exactly one path.
    fn verify_unique(&self, root_table: &str) -> QueryResult<()> {
        let mut seen: HashMap<&str, Vec<String>> = HashMap::new();
        for (path, ja) in &self.entries {
            seen.entry(ja.target.as_str()).or_default().push(path.clone());
            if let Some(t) = &ja.through {
                seen.entry(t.as_str())
                    .or_default()
                    .push(format!("{} (through)", path));
            }
        }
        seen.entry(root_table).or_default().push(String::new());

        match seen.into_iter().find(|(_, paths)| paths.len() > 1) {
            Some((alias, mut paths)) => {
                paths.sort();
                Err(QueryError::AmbiguousAlias {
                    alias: alias.to_string(),
                    paths,
                })
            }
            None => Ok(()),
        }
    }
}
