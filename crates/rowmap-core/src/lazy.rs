//! Two-state lazy relationship references.
//!
//! A relationship field starts either resolved (fresh instances, null
//! foreign keys) or unresolved, holding where its targets live and a weak
//! handle to the session that can load them. Resolution happens on first
//! access and is cached; later accesses never reload.
//!
//! The loader handle is weak: an entity that outlives its session can still
//! read resolved relationships, but touching an unresolved one fails with
//! [`Error::SessionClosed`].

use crate::entity::EntityRef;
use crate::error::{Error, Result, SessionPhase};
use crate::schema::{LinkTableInfo, Multiplicity, RelationshipInfo};
use crate::value::EntityId;
use std::fmt;
use std::sync::{Arc, Weak};

/// Where an unresolved relationship's targets live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazySource {
    /// Target row with a known primary key (owning to-one).
    Key(EntityId),
    /// Target rows whose `column` equals `owner` (one-to-many, inverse one-to-one).
    Column {
        column: &'static str,
        owner: EntityId,
    },
    /// Target keys listed in a link table for `owner` (many-to-many).
    Link {
        link: LinkTableInfo,
        owner: EntityId,
    },
}

/// Loads relationship targets on behalf of an owning session.
///
/// Implementations route every loaded row through their identity map so
/// that collection members share identity with instances loaded any other
/// way.
pub trait LazyLoader: Send + Sync {
    /// Load the instances of `target` described by `source`.
    fn load(&self, target: &'static str, source: &LazySource) -> Result<Vec<EntityRef>>;
}

/// A resolved relationship value.
#[derive(Clone)]
pub enum Resolved {
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl Resolved {
    pub(crate) fn empty(multiplicity: Multiplicity) -> Self {
        match multiplicity {
            Multiplicity::One => Resolved::One(None),
            Multiplicity::Many => Resolved::Many(Vec::new()),
        }
    }

    /// All referenced instances, whatever the multiplicity.
    pub fn refs(&self) -> Vec<EntityRef> {
        match self {
            Resolved::One(one) => one.iter().cloned().collect(),
            Resolved::Many(many) => many.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Resolved::One(one) => usize::from(one.is_some()),
            Resolved::Many(many) => many.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Targets may point back at their owner; print counts only.
        match self {
            Resolved::One(None) => f.write_str("One(None)"),
            Resolved::One(Some(_)) => f.write_str("One(Some(..))"),
            Resolved::Many(many) => write!(f, "Many({} items)", many.len()),
        }
    }
}

pub(crate) enum Access {
    Ready(Resolved),
    Load(LazySource, Weak<dyn LazyLoader>),
}

#[derive(Clone)]
enum LazyState {
    Resolved(Resolved),
    Unresolved {
        source: LazySource,
        loader: Weak<dyn LazyLoader>,
    },
}

/// A relationship field: either resolved or waiting on its session.
#[derive(Clone)]
pub struct Lazy {
    relationship: &'static RelationshipInfo,
    state: LazyState,
    /// Link-table targets as last read from or written to the store.
    loaded_links: Option<Vec<EntityId>>,
}

impl Lazy {
    /// An empty, resolved relationship.
    pub fn empty(relationship: &'static RelationshipInfo) -> Self {
        Self {
            relationship,
            state: LazyState::Resolved(Resolved::empty(relationship.multiplicity())),
            loaded_links: relationship.link_table.map(|_| Vec::new()),
        }
    }

    /// An unresolved relationship to be loaded through `loader`.
    pub fn unresolved(
        relationship: &'static RelationshipInfo,
        source: LazySource,
        loader: Weak<dyn LazyLoader>,
    ) -> Self {
        Self {
            relationship,
            state: LazyState::Unresolved { source, loader },
            loaded_links: None,
        }
    }

    pub fn relationship(&self) -> &'static RelationshipInfo {
        self.relationship
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, LazyState::Resolved(_))
    }

    /// The resolved value, if resolution already happened.
    pub fn resolved(&self) -> Option<&Resolved> {
        match &self.state {
            LazyState::Resolved(r) => Some(r),
            LazyState::Unresolved { .. } => None,
        }
    }

    pub fn source(&self) -> Option<&LazySource> {
        match &self.state {
            LazyState::Resolved(_) => None,
            LazyState::Unresolved { source, .. } => Some(source),
        }
    }

    /// Target key of an unresolved owning to-one reference.
    pub fn pending_key(&self) -> Option<EntityId> {
        match self.source() {
            Some(LazySource::Key(id)) => Some(*id),
            _ => None,
        }
    }

    /// Link-table targets known to be stored, for computing link diffs.
    pub fn loaded_links(&self) -> Option<&[EntityId]> {
        self.loaded_links.as_deref()
    }

    /// Record the link-table targets now stored.
    pub fn set_loaded_links(&mut self, ids: Vec<EntityId>) {
        if self.relationship.link_table.is_some() {
            self.loaded_links = Some(ids);
        }
    }

    /// Replace the value, as an explicit assignment by the caller.
    pub fn assign(&mut self, value: Resolved) -> Result<()> {
        let expected = self.relationship.multiplicity();
        let ok = matches!(
            (&value, expected),
            (Resolved::One(_), Multiplicity::One) | (Resolved::Many(_), Multiplicity::Many)
        );
        if !ok {
            return Err(multiplicity_error(self.relationship, expected));
        }
        self.state = LazyState::Resolved(value);
        Ok(())
    }

    /// Snapshot what is needed to resolve outside any entity lock.
    pub(crate) fn access(&self) -> Access {
        match &self.state {
            LazyState::Resolved(r) => Access::Ready(r.clone()),
            LazyState::Unresolved { source, loader } => Access::Load(source.clone(), loader.clone()),
        }
    }

    /// Mutable collection of a resolved to-many relationship.
    pub(crate) fn many_mut(&mut self) -> Result<&mut Vec<EntityRef>> {
        match &mut self.state {
            LazyState::Resolved(Resolved::Many(many)) => Ok(many),
            LazyState::Resolved(Resolved::One(_)) => {
                Err(multiplicity_error(self.relationship, Multiplicity::Many))
            }
            LazyState::Unresolved { .. } => Err(Error::Custom(format!(
                "relationship '{}' must be resolved before it is modified",
                self.relationship.name
            ))),
        }
    }

    /// Install loaded targets unless someone resolved this reference first.
    pub(crate) fn settle(&mut self, mut loaded: Vec<EntityRef>, ids: Vec<EntityId>) -> Resolved {
        if let LazyState::Resolved(r) = &self.state {
            return r.clone();
        }
        let value = match self.relationship.multiplicity() {
            Multiplicity::One => {
                if loaded.len() > 1 {
                    tracing::warn!(
                        relationship = self.relationship.name,
                        found = loaded.len(),
                        "To-one relationship matched several rows; keeping the first"
                    );
                }
                Resolved::One(if loaded.is_empty() {
                    None
                } else {
                    Some(loaded.swap_remove(0))
                })
            }
            Multiplicity::Many => Resolved::Many(loaded),
        };
        if self.relationship.link_table.is_some() {
            self.loaded_links = Some(ids);
        }
        self.state = LazyState::Resolved(value.clone());
        value
    }
}

/// Run a loader, mapping a dropped session to `SessionClosed`.
pub(crate) fn run_loader(
    relationship: &'static RelationshipInfo,
    source: &LazySource,
    loader: &Weak<dyn LazyLoader>,
) -> Result<Vec<EntityRef>> {
    let loader: Arc<dyn LazyLoader> = loader
        .upgrade()
        .ok_or(Error::SessionClosed(SessionPhase::Dropped))?;
    tracing::debug!(
        relationship = relationship.name,
        target = relationship.target,
        ?source,
        "Resolving lazy relationship"
    );
    loader.load(relationship.target, source)
}

pub(crate) fn multiplicity_error(rel: &'static RelationshipInfo, expected: Multiplicity) -> Error {
    let shape = match expected {
        Multiplicity::One => "to-one",
        Multiplicity::Many => "to-many",
    };
    Error::state(
        crate::error::StateErrorKind::Multiplicity,
        rel.target,
        format!("relationship '{}' is {}", rel.name, shape),
    )
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Lazy");
        s.field("relationship", &self.relationship.name);
        match &self.state {
            LazyState::Resolved(r) => s.field("resolved", r),
            LazyState::Unresolved { source, .. } => s.field("unresolved", source),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RelationshipKind;

    static COURSE_REL: RelationshipInfo =
        RelationshipInfo::new("course", "Course", RelationshipKind::ManyToOne).local_key("course_id");
    static REVIEWS_REL: RelationshipInfo =
        RelationshipInfo::new("reviews", "Review", RelationshipKind::OneToMany)
            .remote_key("course_id");

    #[test]
    fn test_empty_matches_multiplicity() {
        let one = Lazy::empty(&COURSE_REL);
        assert!(matches!(one.resolved(), Some(Resolved::One(None))));
        let many = Lazy::empty(&REVIEWS_REL);
        assert!(matches!(many.resolved(), Some(Resolved::Many(v)) if v.is_empty()));
        assert!(many.loaded_links().is_none());
    }

    #[test]
    fn test_assign_rejects_wrong_shape() {
        let mut one = Lazy::empty(&COURSE_REL);
        let err = one.assign(Resolved::Many(Vec::new())).unwrap_err();
        assert!(err.to_string().contains("to-one"));
    }

    #[test]
    fn test_dropped_loader_is_session_closed() {
        struct NoLoader;
        impl LazyLoader for NoLoader {
            fn load(&self, _: &'static str, _: &LazySource) -> Result<Vec<EntityRef>> {
                Ok(Vec::new())
            }
        }
        let weak: Weak<dyn LazyLoader> = {
            let strong: Arc<dyn LazyLoader> = Arc::new(NoLoader);
            Arc::downgrade(&strong)
        };
        let lazy = Lazy::unresolved(&COURSE_REL, LazySource::Key(EntityId(1)), weak);
        assert_eq!(lazy.pending_key(), Some(EntityId(1)));
        let Access::Load(source, loader) = lazy.access() else {
            panic!("expected an unresolved reference");
        };
        let err = run_loader(&COURSE_REL, &source, &loader).unwrap_err();
        assert!(matches!(err, Error::SessionClosed(SessionPhase::Dropped)));
    }
}
