//! Snapshot change detection.
//!
//! One pass runs three phases over every tracked entry:
//!
//! 1. **Keys.** A changed key on an Added entry moves its identity-map slot
//!    and follows into tracked dependents' foreign keys. A changed key on a
//!    persisted entry is an error.
//! 2. **Relationships.** Navigations and foreign keys are diffed against the
//!    last consistent relationship snapshot and handed to the navigation
//!    fixer, which may start tracking newly reachable entities.
//! 3. **Scalars.** Unchanged and Modified entries compare current values with
//!    their originals. Detected flags are recomputed from scratch each pass;
//!    explicit flags persist. An entry with no flags left falls back to
//!    Unchanged.
//!
//! A second pass with no intervening mutation changes nothing.

use std::sync::Arc;

use ormtrack_core::{Error, FieldsSet, Result};

use crate::entry::EntryId;
use crate::navigation_fixer::NavigationFixer;
use crate::state::EntityState;
use crate::state_manager::StateManager;

/// Run a full detection pass.
pub(crate) fn detect_changes(sm: &mut StateManager) -> Result<()> {
    let start = std::time::Instant::now();
    let ids = sm.ids();

    for id in &ids {
        detect_key_change(sm, *id)?;
    }

    NavigationFixer::new(sm).reconcile_all(ids)?;

    let mut modified = 0usize;
    for id in sm.ids() {
        if detect_scalar_changes(sm, id) {
            modified += 1;
        }
    }

    tracing::debug!(
        entries = sm.len(),
        modified,
        elapsed_us = start.elapsed().as_micros() as u64,
        "Detected changes"
    );
    Ok(())
}

fn detect_key_change(sm: &mut StateManager, id: EntryId) -> Result<()> {
    let model = Arc::clone(sm.model());
    let Some(entry) = sm.entry(id) else {
        return Ok(());
    };
    let et = model.entity_type_at(entry.type_index);
    let state = entry.state;

    if state == EntityState::Added {
        let old = entry.key.as_ref().map(|k| k.values().to_vec());
        let new = sm.compute_key(id);
        if new.as_ref().map(|k| k.values()) == old.as_deref() {
            return Ok(());
        }
        sm.rekey(id)?;
        NavigationFixer::new(sm).propagate_key(id, old.as_deref());
        return Ok(());
    }

    let Some(original) = entry.original.as_ref() else {
        return Ok(());
    };
    for &idx in et.key_indices() {
        let current = entry.current_value(et, idx);
        if !original[idx].same_as(&current) {
            return Err(Error::KeyModified {
                entity_type: et.name().to_string(),
                property: et.property_at(idx).name.clone(),
            });
        }
    }
    Ok(())
}

/// Returns whether the entry ended Modified.
fn detect_scalar_changes(sm: &mut StateManager, id: EntryId) -> bool {
    let model = Arc::clone(sm.model());
    let Some(entry) = sm.entry_mut(id) else {
        return false;
    };
    if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
        return false;
    }
    let et = model.entity_type_at(entry.type_index);
    let Some(original) = entry.original.as_ref() else {
        return false;
    };
    let current = entry.current_values(et);

    let mut detected = FieldsSet::empty(current.len());
    for (idx, property) in et.properties().iter().enumerate() {
        if !property.key && !current[idx].same_as(&original[idx]) {
            detected.set(idx);
        }
    }
    entry.detected_modified = detected;

    sm.refresh_from_flags(id);
    sm.state(id) == EntityState::Modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionConfig;
    use ormtrack_core::{DynamicEntity, EntityRef, EntityType, Model, Property, Value, ValueKind};

    fn manager() -> StateManager {
        let model = Model::builder()
            .entity(
                EntityType::new("Blog")
                    .property(Property::new("id", ValueKind::BigInt).key())
                    .property(Property::new("name", ValueKind::Text))
                    .property(Property::new("rating", ValueKind::Int)),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), SessionConfig::default())
    }

    fn tracked(sm: &mut StateManager, id: i64) -> (EntityRef, EntryId) {
        let blog = DynamicEntity::new("Blog")
            .with("id", id)
            .with("name", "A")
            .with("rating", 1_i32)
            .into_ref();
        let entry = sm
            .start_tracking(blog.clone(), 0, EntityState::Unchanged, false)
            .unwrap();
        (blog, entry)
    }

    #[test]
    fn test_change_promotes_to_modified() {
        let mut sm = manager();
        let (blog, id) = tracked(&mut sm, 1);
        blog.borrow_mut().set_value("name", Value::from("B"));
        detect_changes(&mut sm).unwrap();
        assert_eq!(sm.state(id), EntityState::Modified);
        assert!(sm.entry(id).unwrap().is_property_modified(1));
        assert!(!sm.entry(id).unwrap().is_property_modified(2));
    }

    #[test]
    fn test_reverted_value_falls_back_to_unchanged() {
        let mut sm = manager();
        let (blog, id) = tracked(&mut sm, 1);
        blog.borrow_mut().set_value("name", Value::from("B"));
        detect_changes(&mut sm).unwrap();
        blog.borrow_mut().set_value("name", Value::from("A"));
        detect_changes(&mut sm).unwrap();
        assert_eq!(sm.state(id), EntityState::Unchanged);
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let mut sm = manager();
        let (blog, _) = tracked(&mut sm, 1);
        blog.borrow_mut().set_value("rating", Value::Int(5));
        detect_changes(&mut sm).unwrap();
        sm.take_events();
        detect_changes(&mut sm).unwrap();
        assert!(sm.take_events().is_empty());
    }

    #[test]
    fn test_explicit_flags_survive_detection() {
        let mut sm = manager();
        let (_, id) = tracked(&mut sm, 1);
        sm.entry_mut(id).unwrap().explicit_modified.set(2);
        sm.refresh_from_flags(id);
        detect_changes(&mut sm).unwrap();
        assert_eq!(sm.state(id), EntityState::Modified);
    }

    #[test]
    fn test_key_change_on_persisted_entry_is_rejected() {
        let mut sm = manager();
        let (blog, _) = tracked(&mut sm, 1);
        blog.borrow_mut().set_value("id", Value::BigInt(2));
        assert_eq!(
            detect_changes(&mut sm).unwrap_err(),
            Error::KeyModified {
                entity_type: "Blog".into(),
                property: "id".into()
            }
        );
    }

    #[test]
    fn test_added_entry_is_rekeyed() {
        let mut sm = manager();
        let blog = DynamicEntity::new("Blog").with("id", 0_i64).into_ref();
        let id = sm.start_tracking(blog.clone(), 0, EntityState::Added, false).unwrap();
        blog.borrow_mut().set_value("id", Value::BigInt(9));
        detect_changes(&mut sm).unwrap();
        assert_eq!(sm.compute_key(id).and_then(|k| sm.find_by_key(&k)), Some(id));
        assert_eq!(sm.state(id), EntityState::Added);
    }
}
