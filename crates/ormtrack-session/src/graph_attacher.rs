//! Graph attach: start tracking everything reachable from a root entity.
//!
//! Traversal is breadth-first over navigations, keyed by allocation identity
//! so cyclic graphs are walked once. Tracked entities are walked through but
//! keep their state. States for untracked entities are planned up front and
//! checked for identity conflicts before anything is tracked, so a failed
//! attach leaves the session untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use ormtrack_core::{EntityId, EntityRef, EntityType, Error, Result, Value};

use crate::entry::EntryId;
use crate::identity_map::EntityKey;
use crate::navigation_fixer::NavigationFixer;
use crate::state::EntityState;
use crate::state_manager::StateManager;

/// Key values of an entity that is not tracked yet.
pub(crate) fn read_key(entity: &EntityRef, entity_type: &EntityType) -> Vec<Value> {
    let e = entity.borrow();
    entity_type
        .key_indices()
        .iter()
        .map(|idx| {
            let p = entity_type.property_at(*idx);
            if p.shadow {
                p.initial_value()
            } else {
                e.get_value(&p.name).unwrap_or_else(|| p.initial_value())
            }
        })
        .collect()
}

/// State for an entity discovered through a navigation: Unchanged if every
/// key component holds a non-default value, Added otherwise.
pub(crate) fn state_for_reachable(entity: &EntityRef, entity_type: &EntityType) -> EntityState {
    if entity_type.has_key() && !read_key(entity, entity_type).iter().any(Value::is_default) {
        EntityState::Unchanged
    } else {
        EntityState::Added
    }
}

/// Walk the graph from `root`, returning untracked entities in visit order.
fn discover(sm: &StateManager, root: &EntityRef) -> Result<Vec<(EntityRef, usize)>> {
    let model = Arc::clone(sm.model());
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([root.clone()]);
    let mut found = Vec::new();

    while let Some(entity) = queue.pop_front() {
        if !visited.insert(EntityId::of(&entity)) {
            continue;
        }
        let type_index = match sm.entry_id_of(&entity).and_then(|id| sm.type_index(id)) {
            Some(t) => t,
            None => {
                let t = sm.resolve_type(&entity)?;
                found.push((entity.clone(), t));
                t
            }
        };
        let e = entity.borrow();
        for nav in model.entity_type_at(type_index).navigations() {
            if nav.is_collection {
                queue.extend(e.collection(&nav.name));
            } else if let Some(target) = e.reference(&nav.name) {
                queue.push_back(target);
            }
        }
    }
    Ok(found)
}

/// Track `root` and everything reachable from it.
///
/// The root ends in `requested` (an Added root asked to be Deleted is
/// detached instead). Newly reached entities are Added when `requested` is
/// Added, Unchanged when it is Deleted, and otherwise follow the key
/// heuristic of [`state_for_reachable`].
pub(crate) fn attach_graph(
    sm: &mut StateManager,
    root: &EntityRef,
    requested: EntityState,
) -> Result<EntryId> {
    let model = Arc::clone(sm.model());
    let discovered = discover(sm, root)?;
    let root_id = EntityId::of(root);

    // Plan and verify before touching anything.
    let mut plan = Vec::with_capacity(discovered.len());
    let mut claimed = HashSet::new();
    for (entity, type_index) in discovered {
        let et = model.entity_type_at(type_index);
        let is_root = EntityId::of(&entity) == root_id;
        let state = match (is_root, requested) {
            (true, EntityState::Modified | EntityState::Deleted) => EntityState::Unchanged,
            (true, s) => s,
            (false, EntityState::Added) => EntityState::Added,
            (false, EntityState::Deleted) => EntityState::Unchanged,
            (false, _) => state_for_reachable(&entity, et),
        };
        let key = read_key(&entity, et);
        sm.check_key_free(type_index, &key)?;
        if let Some(k) = EntityKey::assigned(type_index, key.clone()) {
            if !claimed.insert(k) {
                return Err(sm.duplicate_key(type_index, &key));
            }
        }
        plan.push((entity, type_index, state));
    }

    let mut created = Vec::with_capacity(plan.len());
    for (entity, type_index, state) in plan {
        created.push(sm.start_tracking(entity, type_index, state, false)?);
    }

    tracing::debug!(
        root_state = requested.as_str(),
        tracked = created.len(),
        "Attached graph"
    );

    let root_entry = sm
        .entry_id_of(root)
        .ok_or_else(|| Error::InvalidOperation("root entity was not tracked".into()))?;
    let was_new = created.contains(&root_entry);

    let mut fixer = NavigationFixer::new(sm);
    fixer.fixup_new(created)?;

    if requested == EntityState::Deleted {
        fixer.delete(root_entry)?;
    } else if !was_new || requested == EntityState::Modified {
        drop(fixer);
        sm.change_state(root_entry, requested);
    }
    Ok(root_entry)
}

/// Track a single entity without walking its graph.
pub(crate) fn attach_single(
    sm: &mut StateManager,
    entity: &EntityRef,
    state: EntityState,
    from_query: bool,
) -> Result<EntryId> {
    let type_index = sm.resolve_type(entity)?;
    let initial = match state {
        EntityState::Deleted => EntityState::Unchanged,
        s => s,
    };
    let id = sm.start_tracking(entity.clone(), type_index, initial, from_query)?;
    let mut fixer = NavigationFixer::new(sm);
    fixer.fixup_new([id])?;
    if state == EntityState::Deleted {
        fixer.delete(id)?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionConfig;
    use ormtrack_core::{DynamicEntity, ForeignKey, Model, Property, ValueGenerated, ValueKind};

    fn manager() -> StateManager {
        let model = Model::builder()
            .entity(
                EntityType::new("Node")
                    .property(
                        Property::new("id", ValueKind::BigInt)
                            .key()
                            .generated(ValueGenerated::OnAdd),
                    )
                    .property(Property::new("parent_id", ValueKind::BigInt).nullable()),
            )
            .relationship(
                ForeignKey::new("Node", ["parent_id"], "Node")
                    .dependent_navigation("parent")
                    .principal_navigation("children"),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), SessionConfig::default())
    }

    fn node(id: i64) -> EntityRef {
        DynamicEntity::new("Node").with("id", id).into_ref()
    }

    #[test]
    fn test_heuristic_uses_default_key() {
        let sm = manager();
        let et = sm.model().entity_type_at(0).clone();
        assert_eq!(state_for_reachable(&node(0), &et), EntityState::Added);
        assert_eq!(state_for_reachable(&node(4), &et), EntityState::Unchanged);
    }

    #[test]
    fn test_cycle_is_visited_once() {
        let mut sm = manager();
        let a = node(1);
        let b = node(2);
        a.borrow_mut().set_reference("parent", Some(b.clone()));
        b.borrow_mut().set_reference("parent", Some(a.clone()));
        b.borrow_mut().add_to_collection("children", a.clone());
        a.borrow_mut().add_to_collection("children", b.clone());

        attach_graph(&mut sm, &a, EntityState::Unchanged).unwrap();
        assert_eq!(sm.len(), 2);
        assert_eq!(sm.state(sm.entry_id_of(&b).unwrap()), EntityState::Unchanged);
    }

    #[test]
    fn test_duplicate_in_graph_tracks_nothing() {
        let mut sm = manager();
        let a = node(1);
        let twin = node(1);
        a.borrow_mut().add_to_collection("children", twin);
        assert!(attach_graph(&mut sm, &a, EntityState::Unchanged).is_err());
        assert_eq!(sm.len(), 0);
    }

    #[test]
    fn test_deleted_root_attaches_others_unchanged() {
        let mut sm = manager();
        let root = node(1);
        let child = node(0);
        root.borrow_mut().add_to_collection("children", child.clone());
        let id = attach_graph(&mut sm, &root, EntityState::Deleted).unwrap();
        assert_eq!(sm.state(id), EntityState::Deleted);
        let child_id = sm.entry_id_of(&child).unwrap();
        assert_eq!(sm.state(child_id), EntityState::Unchanged);
    }
}
