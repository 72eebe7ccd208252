//! Session-scoped tracking state.
//!
//! [`StateManager`] owns every tracked entry, the identity map and the event
//! queue. Components (change detector, navigation fixer, graph attacher, save
//! coordinator) receive it by `&mut` reference; nothing here is global.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ormtrack_core::{EntityId, EntityRef, EntityType, Error, Model, Result, Value};

use crate::SessionConfig;
use crate::entry::{EntryId, EntryView, TrackedEntry};
use crate::events::{StateChangedEvent, TrackedEvent, TrackingEvent};
use crate::identity_map::{EntityKey, IdentityMap};
use crate::state::EntityState;

pub(crate) struct StateManager {
    model: Arc<Model>,
    config: SessionConfig,
    entries: BTreeMap<EntryId, TrackedEntry>,
    by_entity: HashMap<EntityId, EntryId>,
    identity: IdentityMap,
    next_id: usize,
    events: Vec<TrackingEvent>,
}

impl StateManager {
    pub(crate) fn new(model: Arc<Model>, config: SessionConfig) -> Self {
        Self {
            model,
            config,
            entries: BTreeMap::new(),
            by_entity: HashMap::new(),
            identity: IdentityMap::default(),
            next_id: 1,
            events: Vec::new(),
        }
    }

    pub(crate) fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub(crate) fn entry(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn lookup(&self, entity: EntityId) -> Option<EntryId> {
        self.by_entity.get(&entity).copied()
    }

    pub(crate) fn entry_id_of(&self, entity: &EntityRef) -> Option<EntryId> {
        self.lookup(EntityId::of(entity))
    }

    pub(crate) fn find_by_key(&self, key: &EntityKey) -> Option<EntryId> {
        self.identity.find(key)
    }

    pub(crate) fn ids(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn ids_of_type(&self, type_index: usize) -> Vec<EntryId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.type_index == type_index)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn identity_len(&self) -> usize {
        self.identity.len()
    }

    pub(crate) fn state(&self, id: EntryId) -> EntityState {
        self.entries
            .get(&id)
            .map_or(EntityState::Detached, |e| e.state)
    }

    pub(crate) fn entity(&self, id: EntryId) -> Option<EntityRef> {
        self.entries.get(&id).map(|e| e.entity.clone())
    }

    pub(crate) fn type_index(&self, id: EntryId) -> Option<usize> {
        self.entries.get(&id).map(|e| e.type_index)
    }

    /// Resolve an entity's type from its self-reported name.
    pub(crate) fn resolve_type(&self, entity: &EntityRef) -> Result<usize> {
        let name = entity.borrow().entity_type().to_string();
        self.model
            .entity_type_index(&name)
            .ok_or(Error::UnknownEntityType(name))
    }

    pub(crate) fn view(&self, id: EntryId) -> Option<EntryView> {
        let entry = self.entries.get(&id)?;
        Some(entry.view(id, self.model.entity_type_at(entry.type_index)))
    }

    // ========================================================================
    // Values
    // ========================================================================

    pub(crate) fn value(&self, id: EntryId, index: usize) -> Option<Value> {
        let entry = self.entries.get(&id)?;
        Some(entry.current_value(self.model.entity_type_at(entry.type_index), index))
    }

    pub(crate) fn values_at(&self, id: EntryId, indices: &[usize]) -> Vec<Value> {
        self.entries.get(&id).map_or_else(Vec::new, |entry| {
            entry.values_at(self.model.entity_type_at(entry.type_index), indices)
        })
    }

    /// Write property values by index. Returns whether anything changed.
    pub(crate) fn write_values(&mut self, id: EntryId, indices: &[usize], values: &[Value]) -> bool {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let et = model.entity_type_at(entry.type_index);
        let mut changed = false;
        for (idx, value) in indices.iter().zip(values) {
            changed |= entry.write_value(et, *idx, value.clone());
        }
        changed
    }

    pub(crate) fn key_values(&self, id: EntryId) -> Vec<Value> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        let et = self.model.entity_type_at(entry.type_index);
        entry.values_at(et, et.key_indices())
    }

    pub(crate) fn compute_key(&self, id: EntryId) -> Option<EntityKey> {
        let type_index = self.type_index(id)?;
        EntityKey::assigned(type_index, self.key_values(id))
    }

    /// Key rendering for errors and logs. Values only with sensitive logging.
    pub(crate) fn describe_key(&self, entity_type: &EntityType, values: &[Value]) -> String {
        let names = entity_type
            .key_indices()
            .iter()
            .map(|idx| entity_type.property_at(*idx).name.as_str());
        if self.config.sensitive_logging {
            names
                .zip(values)
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            names.collect::<Vec<_>>().join(", ")
        }
    }

    pub(crate) fn duplicate_key(&self, type_index: usize, values: &[Value]) -> Error {
        let et = self.model.entity_type_at(type_index);
        Error::DuplicateKey {
            entity_type: et.name().to_string(),
            key: self.describe_key(et, values),
        }
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Fail with `DuplicateKey` if an entry already holds this key.
    pub(crate) fn check_key_free(&self, type_index: usize, values: &[Value]) -> Result<()> {
        if let Some(key) = EntityKey::assigned(type_index, values.to_vec()) {
            if self.identity.find(&key).is_some() {
                return Err(self.duplicate_key(type_index, values));
            }
        }
        Ok(())
    }

    /// Create an entry for an untracked entity.
    pub(crate) fn start_tracking(
        &mut self,
        entity: EntityRef,
        type_index: usize,
        state: EntityState,
        from_query: bool,
    ) -> Result<EntryId> {
        let model = Arc::clone(&self.model);
        let et = model.entity_type_at(type_index);
        let entity_id = EntityId::of(&entity);
        if let Some(existing) = self.by_entity.get(&entity_id) {
            return Err(Error::InvalidOperation(format!(
                "entity of type '{}' is already tracked as entry {}",
                et.name(),
                existing.as_usize()
            )));
        }

        let mut entry = TrackedEntry::new(entity.clone(), type_index, et);
        let key_values = entry.values_at(et, et.key_indices());
        let key = EntityKey::assigned(type_index, key_values.clone());
        let id = EntryId::from_raw(self.next_id);
        if let Some(k) = &key {
            if self.identity.insert(k.clone(), id).is_err() {
                return Err(self.duplicate_key(type_index, &key_values));
            }
        }
        self.next_id += 1;

        entry.state = state;
        if state.is_persisted() {
            entry.original = Some(entry.current_values(et));
        }
        if state == EntityState::Modified {
            flag_all_non_key(&mut entry, et);
        }
        entry.key = key;

        tracing::debug!(
            entity_type = et.name(),
            entry = id.as_usize(),
            state = state.as_str(),
            from_query,
            "Tracking entity"
        );

        self.entries.insert(id, entry);
        self.by_entity.insert(entity_id, id);
        self.events.push(TrackingEvent::Tracked(TrackedEvent {
            entity,
            entity_type: et.name().to_string(),
            state,
            from_query,
        }));
        Ok(id)
    }

    /// Discard an entry. Other entries forget it in their relationship snapshots.
    pub(crate) fn stop_tracking(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.by_entity.remove(&entry.entity_id);
        if let Some(key) = &entry.key {
            self.identity.remove(key, id);
        }
        for other in self.entries.values_mut() {
            other.relationships.forget(entry.entity_id);
        }

        let entity_type = self.model.entity_type_at(entry.type_index).name().to_string();
        tracing::debug!(
            entity_type = %entity_type,
            entry = id.as_usize(),
            from = entry.state.as_str(),
            to = "detached",
            "Entry discarded"
        );
        self.events
            .push(TrackingEvent::StateChanged(StateChangedEvent {
                entity: entry.entity,
                entity_type,
                old_state: entry.state,
                new_state: EntityState::Detached,
            }));
    }

    /// Change state without touching values or flags.
    pub(crate) fn set_state_raw(&mut self, id: EntryId, new_state: EntityState) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let old_state = entry.state;
        if old_state == new_state {
            return;
        }
        entry.state = new_state;
        let entity_type = model.entity_type_at(entry.type_index).name();
        tracing::debug!(
            entity_type,
            entry = id.as_usize(),
            from = old_state.as_str(),
            to = new_state.as_str(),
            "State changed"
        );
        let event = StateChangedEvent {
            entity: entry.entity.clone(),
            entity_type: entity_type.to_string(),
            old_state,
            new_state,
        };
        self.events.push(TrackingEvent::StateChanged(event));
    }

    /// Apply an explicit state change with its side effects on snapshots and
    /// flags. Deletion cascades are the navigation fixer's job.
    pub(crate) fn change_state(&mut self, id: EntryId, new_state: EntityState) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let et = model.entity_type_at(entry.type_index);
        let old_state = entry.state;

        match (old_state, new_state) {
            (_, EntityState::Detached) | (EntityState::Added, EntityState::Deleted) => {
                self.stop_tracking(id);
                return;
            }
            (_, EntityState::Added) => {
                entry.original = None;
                entry.clear_modified();
            }
            (_, EntityState::Unchanged) => {
                entry.original = Some(entry.current_values(et));
                entry.clear_modified();
            }
            (_, EntityState::Modified) => {
                if entry.original.is_none() {
                    entry.original = Some(entry.current_values(et));
                }
                flag_all_non_key(entry, et);
            }
            (_, EntityState::Deleted) => {
                if entry.original.is_none() {
                    entry.original = Some(entry.current_values(et));
                }
            }
        }
        self.set_state_raw(id, new_state);
    }

    /// Recompute Unchanged/Modified from the property flags.
    pub(crate) fn refresh_from_flags(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let next = match entry.state {
            EntityState::Unchanged | EntityState::Modified if entry.any_modified() => {
                EntityState::Modified
            }
            EntityState::Unchanged | EntityState::Modified => EntityState::Unchanged,
            _ => return,
        };
        self.set_state_raw(id, next);
    }

    /// Move the entry's identity-map slot to its current key.
    pub(crate) fn rekey(&mut self, id: EntryId) -> Result<()> {
        let Some(type_index) = self.type_index(id) else {
            return Ok(());
        };
        let values = self.key_values(id);
        let new_key = EntityKey::assigned(type_index, values.clone());
        let old_key = self.entries.get(&id).and_then(|e| e.key.clone());
        if old_key == new_key {
            return Ok(());
        }
        if self
            .identity
            .rekey(old_key.as_ref(), new_key.clone(), id)
            .is_err()
        {
            return Err(self.duplicate_key(type_index, &values));
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = new_key;
        }
        Ok(())
    }

    /// Make current values the new originals and move to Unchanged.
    /// Deleted entries are discarded.
    pub(crate) fn accept_changes(&mut self, id: EntryId) {
        match self.state(id) {
            EntityState::Deleted => self.stop_tracking(id),
            EntityState::Detached => {}
            _ => self.change_state(id, EntityState::Unchanged),
        }
    }

    /// Detach everything.
    pub(crate) fn clear(&mut self) {
        for id in self.ids() {
            self.stop_tracking(id);
        }
        self.identity.clear();
    }

    pub(crate) fn count(&self, state: EntityState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        self.entries.values().any(|e| e.state.has_pending_write())
    }

    pub(crate) fn take_events(&mut self) -> Vec<TrackingEvent> {
        std::mem::take(&mut self.events)
    }
}

fn flag_all_non_key(entry: &mut TrackedEntry, entity_type: &EntityType) {
    for (idx, p) in entity_type.properties().iter().enumerate() {
        if !p.key {
            entry.explicit_modified.set(idx);
        }
    }
}

/// Element-wise [`Value::same_as`].
pub(crate) fn same_values(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormtrack_core::{DynamicEntity, EntityType, Property, ValueKind};

    fn manager() -> StateManager {
        let model = Model::builder()
            .entity(
                EntityType::new("Blog")
                    .property(Property::new("id", ValueKind::BigInt).key())
                    .property(Property::new("name", ValueKind::Text)),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), SessionConfig::default())
    }

    fn blog(id: i64, name: &str) -> EntityRef {
        DynamicEntity::new("Blog")
            .with("id", id)
            .with("name", name)
            .into_ref()
    }

    #[test]
    fn test_start_tracking_claims_identity_slot() {
        let mut sm = manager();
        let id = sm.start_tracking(blog(1, "A"), 0, EntityState::Unchanged, false).unwrap();
        let key = EntityKey::assigned(0, vec![Value::BigInt(1)]).unwrap();
        assert_eq!(sm.find_by_key(&key), Some(id));
        assert!(sm.entry(id).unwrap().original.is_some());
        assert_eq!(sm.take_events().len(), 1);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut sm = manager();
        sm.start_tracking(blog(1, "A"), 0, EntityState::Unchanged, false).unwrap();
        let err = sm
            .start_tracking(blog(1, "B"), 0, EntityState::Unchanged, false)
            .unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateKey {
                entity_type: "Blog".into(),
                key: "id".into()
            }
        );
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_rejected_duplicate_keeps_slot_and_ids() {
        let mut sm = manager();
        let first = sm.start_tracking(blog(1, "A"), 0, EntityState::Unchanged, false).unwrap();
        assert!(sm
            .start_tracking(blog(1, "B"), 0, EntityState::Unchanged, false)
            .is_err());

        let key = EntityKey::assigned(0, vec![Value::BigInt(1)]).unwrap();
        assert_eq!(sm.find_by_key(&key), Some(first));
        assert_eq!(sm.identity_len(), 1);
        let next = sm.start_tracking(blog(2, "C"), 0, EntityState::Unchanged, false).unwrap();
        assert_eq!(next.as_usize(), first.as_usize() + 1);
    }

    #[test]
    fn test_unassigned_key_tracks_without_slot() {
        let mut sm = manager();
        sm.start_tracking(blog(0, "A"), 0, EntityState::Added, false).unwrap();
        sm.start_tracking(blog(0, "B"), 0, EntityState::Added, false).unwrap();
        assert_eq!(sm.len(), 2);
        assert_eq!(sm.identity_len(), 0);
    }

    #[test]
    fn test_added_to_deleted_detaches() {
        let mut sm = manager();
        let id = sm.start_tracking(blog(0, "A"), 0, EntityState::Added, false).unwrap();
        sm.change_state(id, EntityState::Deleted);
        assert!(!sm.contains(id));
        assert_eq!(sm.state(id), EntityState::Detached);
    }

    #[test]
    fn test_set_modified_flags_non_key_properties() {
        let mut sm = manager();
        let id = sm.start_tracking(blog(1, "A"), 0, EntityState::Unchanged, false).unwrap();
        sm.change_state(id, EntityState::Modified);
        let entry = sm.entry(id).unwrap();
        assert!(!entry.is_property_modified(0));
        assert!(entry.is_property_modified(1));
    }

    #[test]
    fn test_rekey_conflict_is_duplicate_key() {
        let mut sm = manager();
        let sensitive = SessionConfig::default().sensitive_logging(true);
        sm.config = sensitive;
        let a = blog(1, "A");
        sm.start_tracking(a, 0, EntityState::Unchanged, false).unwrap();
        let b = blog(0, "B");
        let id = sm.start_tracking(b.clone(), 0, EntityState::Added, false).unwrap();
        b.borrow_mut().set_value("id", Value::BigInt(1));
        let err = sm.rekey(id).unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateKey {
                entity_type: "Blog".into(),
                key: "id=1".into()
            }
        );
    }

    #[test]
    fn test_stop_tracking_releases_slot_and_emits_event() {
        let mut sm = manager();
        let id = sm.start_tracking(blog(1, "A"), 0, EntityState::Unchanged, false).unwrap();
        sm.take_events();
        sm.stop_tracking(id);
        assert_eq!(sm.identity_len(), 0);
        let events = sm.take_events();
        assert!(matches!(
            &events[..],
            [TrackingEvent::StateChanged(e)] if e.new_state == EntityState::Detached
        ));
    }
}
