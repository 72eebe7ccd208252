//! Tracking events.
//!
//! Components queue events on the state manager while they hold it; the
//! session drains and dispatches them once the borrow is released, still
//! inside the operation that produced them.

use ormtrack_core::EntityRef;

use crate::state::EntityState;

/// An entity started being tracked.
#[derive(Clone)]
pub struct TrackedEvent {
    /// The entity.
    pub entity: EntityRef,
    /// Entity type name.
    pub entity_type: String,
    /// State it was tracked in.
    pub state: EntityState,
    /// Whether tracking came from query materialization.
    pub from_query: bool,
}

/// A tracked entity changed state.
#[derive(Clone)]
pub struct StateChangedEvent {
    /// The entity.
    pub entity: EntityRef,
    /// Entity type name.
    pub entity_type: String,
    /// Previous state.
    pub old_state: EntityState,
    /// New state. `Detached` when the entry was discarded.
    pub new_state: EntityState,
}

/// Queued event.
#[derive(Clone)]
pub(crate) enum TrackingEvent {
    Tracked(TrackedEvent),
    StateChanged(StateChangedEvent),
}

impl std::fmt::Debug for TrackedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEvent")
            .field("entity_type", &self.entity_type)
            .field("state", &self.state)
            .field("from_query", &self.from_query)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for StateChangedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChangedEvent")
            .field("entity_type", &self.entity_type)
            .field("old_state", &self.old_state)
            .field("new_state", &self.new_state)
            .finish_non_exhaustive()
    }
}
