//! Entity states.

use std::fmt;

/// State of an entity with respect to the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked by the session.
    #[default]
    Detached,
    /// Tracked and matching the database as of the last load/save.
    Unchanged,
    /// New; will be inserted on save.
    Added,
    /// Tracked with local changes; will be updated on save.
    Modified,
    /// Marked for deletion on save.
    Deleted,
}

impl EntityState {
    /// Whether the state implies an entry in the session.
    pub const fn is_tracked(self) -> bool {
        !matches!(self, EntityState::Detached)
    }

    /// Whether save will write something for this state.
    pub const fn has_pending_write(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Whether the entity is believed to exist in the database.
    pub const fn is_persisted(self) -> bool {
        matches!(
            self,
            EntityState::Unchanged | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Lowercase name, used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Detached => "detached",
            EntityState::Unchanged => "unchanged",
            EntityState::Added => "added",
            EntityState::Modified => "modified",
            EntityState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!EntityState::Detached.is_tracked());
        assert!(EntityState::Unchanged.is_tracked());
        assert!(!EntityState::Unchanged.has_pending_write());
        assert!(EntityState::Deleted.has_pending_write());
        assert!(!EntityState::Added.is_persisted());
        assert_eq!(EntityState::default(), EntityState::Detached);
        assert_eq!(EntityState::Modified.to_string(), "modified");
    }
}
