//! Relationship fixup.
//!
//! Keeps both ends of every relationship consistent: the dependent's foreign
//! key values, the dependent's reference navigation and the principal's
//! collection (or unique reference) navigation.
//!
//! Each entry carries a [`RelationshipSnapshot`](crate::entry::RelationshipSnapshot)
//! of the relationship state last made consistent. Reconciling an entry diffs
//! its live navigations and foreign keys against that snapshot; every write
//! the fixer performs updates the affected snapshots first, so a write that is
//! already in place produces no further work and cycles terminate.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use ormtrack_core::{DeleteBehavior, EntityId, EntityRef, Model, Result, Value};

use crate::entry::EntryId;
use crate::graph_attacher;
use crate::identity_map::EntityKey;
use crate::state::EntityState;
use crate::state_manager::{StateManager, same_values};

pub(crate) struct NavigationFixer<'a> {
    sm: &'a mut StateManager,
    model: Arc<Model>,
    pending: VecDeque<(EntryId, bool)>,
    orphans: Vec<(EntryId, usize, EntryId)>,
    deleting: HashSet<EntryId>,
}

impl<'a> NavigationFixer<'a> {
    pub(crate) fn new(sm: &'a mut StateManager) -> Self {
        let model = Arc::clone(sm.model());
        Self {
            sm,
            model,
            pending: VecDeque::new(),
            orphans: Vec::new(),
            deleting: HashSet::new(),
        }
    }

    /// Reconcile existing entries with their live navigations and foreign keys.
    pub(crate) fn reconcile_all(&mut self, ids: impl IntoIterator<Item = EntryId>) -> Result<()> {
        self.pending.extend(ids.into_iter().map(|id| (id, false)));
        self.drain()
    }

    /// Initial fixup for entries that just started being tracked: reconcile
    /// their own navigations and collect tracked dependents that point at them.
    pub(crate) fn fixup_new(&mut self, ids: impl IntoIterator<Item = EntryId>) -> Result<()> {
        self.pending.extend(ids.into_iter().map(|id| (id, true)));
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        while let Some((id, initial)) = self.pending.pop_front() {
            match self.sm.state(id) {
                EntityState::Detached | EntityState::Deleted => continue,
                _ => {}
            }
            self.reconcile(id)?;
            if initial {
                self.collect_dependents(id)?;
            }
        }
        self.delete_orphans()
    }

    // ========================================================================
    // Snapshot access
    // ========================================================================

    fn entity_id(&self, id: EntryId) -> Option<EntityId> {
        self.sm.entry(id).map(|e| e.entity_id)
    }

    fn snapshot_reference(&self, id: EntryId, nav: usize) -> Option<EntityId> {
        self.sm
            .entry(id)
            .and_then(|e| e.relationships.references.get(nav).copied().flatten())
    }

    fn snapshot_collection(&self, id: EntryId, nav: usize) -> Vec<EntityId> {
        self.sm
            .entry(id)
            .and_then(|e| e.relationships.collections.get(nav).cloned())
            .unwrap_or_default()
    }

    fn set_snapshot_reference(&mut self, id: EntryId, nav: usize, target: Option<EntityId>) {
        if let Some(slot) = self
            .sm
            .entry_mut(id)
            .and_then(|e| e.relationships.references.get_mut(nav))
        {
            *slot = target;
        }
    }

    fn set_snapshot_collection(&mut self, id: EntryId, nav: usize, members: Vec<EntityId>) {
        if let Some(slot) = self
            .sm
            .entry_mut(id)
            .and_then(|e| e.relationships.collections.get_mut(nav))
        {
            *slot = members;
        }
    }

    /// Record the dependent's current foreign key values as consistent.
    fn record_foreign_key(&mut self, dependent: EntryId, fk_idx: usize) {
        let model = Arc::clone(&self.model);
        let Some(type_index) = self.sm.type_index(dependent) else {
            return;
        };
        let Some(pos) = model
            .entity_type_at(type_index)
            .foreign_keys()
            .iter()
            .position(|f| *f == fk_idx)
        else {
            return;
        };
        let values = self
            .sm
            .values_at(dependent, model.foreign_key_at(fk_idx).property_indices());
        if let Some(slot) = self
            .sm
            .entry_mut(dependent)
            .and_then(|e| e.relationships.foreign_keys.get_mut(pos))
        {
            *slot = Some(values);
        }
    }

    fn dependent_nav(&self, fk_idx: usize) -> Option<usize> {
        let fk = self.model.foreign_key_at(fk_idx);
        let name = fk.dependent_navigation.as_deref()?;
        self.model
            .entity_type_at(fk.dependent_index())
            .navigations()
            .iter()
            .position(|n| n.name == name)
    }

    fn principal_nav(&self, fk_idx: usize) -> Option<usize> {
        let fk = self.model.foreign_key_at(fk_idx);
        let name = fk.principal_navigation.as_deref()?;
        self.model
            .entity_type_at(fk.principal_index())
            .navigations()
            .iter()
            .position(|n| n.name == name)
    }

    fn nav_name(&self, id: EntryId, nav: usize) -> Option<String> {
        let type_index = self.sm.type_index(id)?;
        self.model
            .entity_type_at(type_index)
            .navigations()
            .get(nav)
            .map(|n| n.name.clone())
    }

    // ========================================================================
    // Entity writes (idempotent)
    // ========================================================================

    fn set_reference(&mut self, id: EntryId, nav: usize, target: Option<EntityRef>) {
        let (Some(entity), Some(name)) = (self.sm.entity(id), self.nav_name(id, nav)) else {
            return;
        };
        let target_id = target.as_ref().map(EntityId::of);
        let current = entity.borrow().reference(&name).map(|e| EntityId::of(&e));
        if current != target_id {
            entity.borrow_mut().set_reference(&name, target);
        }
        self.set_snapshot_reference(id, nav, target_id);
    }

    fn add_member(&mut self, id: EntryId, nav: usize, item: EntityRef) {
        let (Some(entity), Some(name)) = (self.sm.entity(id), self.nav_name(id, nav)) else {
            return;
        };
        let item_id = EntityId::of(&item);
        let present = entity
            .borrow()
            .collection(&name)
            .iter()
            .any(|e| EntityId::of(e) == item_id);
        if !present {
            entity.borrow_mut().add_to_collection(&name, item);
        }
        let mut members = self.snapshot_collection(id, nav);
        if !members.contains(&item_id) {
            members.push(item_id);
            self.set_snapshot_collection(id, nav, members);
        }
    }

    fn remove_member(&mut self, id: EntryId, nav: usize, item: &EntityRef) {
        let (Some(entity), Some(name)) = (self.sm.entity(id), self.nav_name(id, nav)) else {
            return;
        };
        let item_id = EntityId::of(item);
        let present = entity
            .borrow()
            .collection(&name)
            .iter()
            .any(|e| EntityId::of(e) == item_id);
        if present {
            entity.borrow_mut().remove_from_collection(&name, item);
        }
        let mut members = self.snapshot_collection(id, nav);
        members.retain(|m| *m != item_id);
        self.set_snapshot_collection(id, nav, members);
    }

    /// Take `dependent` out of `principal`'s inverse navigation.
    fn remove_from_principal(&mut self, principal: EntryId, fk_idx: usize, dependent: EntryId) {
        let Some(pn) = self.principal_nav(fk_idx) else {
            return;
        };
        let (Some(principal_type), Some(dep_entity)) =
            (self.sm.type_index(principal), self.sm.entity(dependent))
        else {
            return;
        };
        if principal_type != self.model.foreign_key_at(fk_idx).principal_index() {
            return;
        }
        let is_collection = self.model.entity_type_at(principal_type).navigations()[pn].is_collection;
        if is_collection {
            self.remove_member(principal, pn, &dep_entity);
        } else if self.snapshot_reference(principal, pn) == Some(EntityId::of(&dep_entity)) {
            self.set_reference(principal, pn, None);
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    fn reconcile(&mut self, id: EntryId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let (Some(entity), Some(type_index)) = (self.sm.entity(id), self.sm.type_index(id)) else {
            return Ok(());
        };
        let et = model.entity_type_at(type_index);

        for (ni, nav) in et.navigations().iter().enumerate() {
            if !self.sm.contains(id) {
                return Ok(());
            }
            if nav.is_collection {
                let current = entity.borrow().collection(&nav.name);
                let current_ids: Vec<EntityId> = current.iter().map(EntityId::of).collect();
                let previous = self.snapshot_collection(id, ni);
                let added: Vec<EntityRef> = current
                    .into_iter()
                    .filter(|e| !previous.contains(&EntityId::of(e)))
                    .collect();
                let removed: Vec<EntityId> = previous
                    .iter()
                    .filter(|p| !current_ids.contains(p))
                    .copied()
                    .collect();
                if added.is_empty() && removed.is_empty() {
                    continue;
                }
                self.set_snapshot_collection(id, ni, current_ids);
                self.on_collection_changed(id, ni, added, removed)?;
            } else {
                let current = entity.borrow().reference(&nav.name);
                let current_id = current.as_ref().map(EntityId::of);
                let previous = self.snapshot_reference(id, ni);
                if current_id == previous {
                    continue;
                }
                self.set_snapshot_reference(id, ni, current_id);
                self.on_reference_changed(id, ni, previous, current)?;
            }
        }

        for (pos, &fk_idx) in et.foreign_keys().iter().enumerate() {
            if !self.sm.contains(id) {
                return Ok(());
            }
            let fk = model.foreign_key_at(fk_idx);
            let current = self.sm.values_at(id, fk.property_indices());
            let previous = self
                .sm
                .entry(id)
                .and_then(|e| e.relationships.foreign_keys.get(pos).cloned())
                .flatten();
            if previous.as_ref().is_some_and(|p| same_values(p, &current)) {
                continue;
            }
            self.record_foreign_key(id, fk_idx);
            self.on_foreign_key_changed(id, fk_idx, previous, &current)?;
        }
        Ok(())
    }

    /// A reference navigation on `id` now points at `new` instead of `old`.
    pub(crate) fn on_reference_changed(
        &mut self,
        id: EntryId,
        nav: usize,
        old: Option<EntityId>,
        new: Option<EntityRef>,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(type_index) = self.sm.type_index(id) else {
            return Ok(());
        };
        let navigation = &model.entity_type_at(type_index).navigations()[nav];
        let fk_idx = navigation.foreign_key;
        let old_entry = old.and_then(|e| self.sm.lookup(e));

        if navigation.on_dependent {
            if let Some(old_principal) = old_entry {
                self.remove_from_principal(old_principal, fk_idx, id);
            }
            match new {
                Some(target) => {
                    let principal = self.ensure_tracked(target)?;
                    self.relate(id, fk_idx, principal)?;
                }
                None => self.sever(id, fk_idx, old_entry),
            }
        } else {
            if let Some(old_dependent) = old_entry {
                self.release(old_dependent, fk_idx, id);
            }
            if let Some(target) = new {
                let dependent = self.ensure_tracked(target)?;
                self.relate(dependent, fk_idx, id)?;
            }
        }
        Ok(())
    }

    /// Members were added to or removed from a collection navigation on `id`.
    pub(crate) fn on_collection_changed(
        &mut self,
        id: EntryId,
        nav: usize,
        added: Vec<EntityRef>,
        removed: Vec<EntityId>,
    ) -> Result<()> {
        let Some(type_index) = self.sm.type_index(id) else {
            return Ok(());
        };
        let fk_idx = self.model.entity_type_at(type_index).navigations()[nav].foreign_key;
        for gone in removed {
            if let Some(dependent) = self.sm.lookup(gone) {
                self.release(dependent, fk_idx, id);
            }
        }
        for item in added {
            let dependent = self.ensure_tracked(item)?;
            self.relate(dependent, fk_idx, id)?;
        }
        Ok(())
    }

    /// Foreign key values on `dependent` changed without a navigation change.
    pub(crate) fn on_foreign_key_changed(
        &mut self,
        dependent: EntryId,
        fk_idx: usize,
        previous: Option<Vec<Value>>,
        current: &[Value],
    ) -> Result<()> {
        let fk = self.model.foreign_key_at(fk_idx);
        let principal_type = fk.principal_index();
        let new_principal = EntityKey::assigned(principal_type, current.to_vec())
            .and_then(|k| self.sm.find_by_key(&k));
        let dn = self.dependent_nav(fk_idx);

        let mut former = Vec::new();
        if let Some(dn) = dn {
            if let Some(e) = self
                .snapshot_reference(dependent, dn)
                .and_then(|t| self.sm.lookup(t))
            {
                former.push(e);
            }
        }
        if let Some(prev) = previous {
            if let Some(e) = EntityKey::assigned(principal_type, prev).and_then(|k| self.sm.find_by_key(&k)) {
                if !former.contains(&e) {
                    former.push(e);
                }
            }
        }

        for old in former {
            if Some(old) == new_principal {
                continue;
            }
            self.remove_from_principal(old, fk_idx, dependent);
            if let Some(dn) = dn {
                if self.snapshot_reference(dependent, dn) == self.entity_id(old) {
                    self.set_reference(dependent, dn, None);
                }
            }
        }
        if let Some(principal) = new_principal {
            self.relate(dependent, fk_idx, principal)?;
        }
        Ok(())
    }

    /// Make `dependent` reference `principal` on every side of the relationship.
    fn relate(&mut self, dependent: EntryId, fk_idx: usize, principal: EntryId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key_at(fk_idx);
        let (Some(p_entity), Some(d_entity)) = (self.sm.entity(principal), self.sm.entity(dependent))
        else {
            return Ok(());
        };
        let dn = self.dependent_nav(fk_idx);
        let pn = self.principal_nav(fk_idx);

        let mut former = Vec::new();
        if let Some(dn) = dn {
            if let Some(e) = self
                .snapshot_reference(dependent, dn)
                .and_then(|t| self.sm.lookup(t))
            {
                former.push(e);
            }
        }
        let fk_values = self.sm.values_at(dependent, fk.property_indices());
        if let Some(e) =
            EntityKey::assigned(fk.principal_index(), fk_values).and_then(|k| self.sm.find_by_key(&k))
        {
            former.push(e);
        }
        for old in former {
            if old != principal {
                self.remove_from_principal(old, fk_idx, dependent);
            }
        }

        let key = self.sm.values_at(principal, fk.principal_key_indices());
        self.sm.write_values(dependent, fk.property_indices(), &key);
        self.record_foreign_key(dependent, fk_idx);

        if let Some(dn) = dn {
            self.set_reference(dependent, dn, Some(p_entity.clone()));
        }

        if let Some(pn) = pn {
            let is_collection = model.entity_type_at(fk.principal_index()).navigations()[pn].is_collection;
            if is_collection {
                self.add_member(principal, pn, d_entity);
            } else {
                let d_id = EntityId::of(&d_entity);
                let displaced = self
                    .nav_name(principal, pn)
                    .and_then(|name| p_entity.borrow().reference(&name))
                    .filter(|cur| EntityId::of(cur) != d_id)
                    .and_then(|cur| self.sm.entry_id_of(&cur));
                if let Some(other) = displaced {
                    self.release(other, fk_idx, principal);
                }
                self.set_reference(principal, pn, Some(d_entity));
            }
        }
        Ok(())
    }

    fn is_related(&self, dependent: EntryId, fk_idx: usize, principal: EntryId) -> bool {
        let (Some(p_id), Some(d_id)) = (self.entity_id(principal), self.entity_id(dependent)) else {
            return false;
        };
        if let Some(dn) = self.dependent_nav(fk_idx) {
            if let Some(target) = self.snapshot_reference(dependent, dn) {
                return target == p_id;
            }
        }
        if self.in_inverse(principal, fk_idx, d_id) {
            return true;
        }
        let fk = self.model.foreign_key_at(fk_idx);
        let key = self.sm.values_at(principal, fk.principal_key_indices());
        if EntityKey::assigned(fk.principal_index(), key.clone()).is_none() {
            return false;
        }
        same_values(&self.sm.values_at(dependent, fk.property_indices()), &key)
    }

    /// Whether `principal`'s inverse navigation holds `dependent`.
    fn in_inverse(&self, principal: EntryId, fk_idx: usize, dependent: EntityId) -> bool {
        self.principal_nav(fk_idx).is_some_and(|pn| {
            self.snapshot_collection(principal, pn).contains(&dependent)
                || self.snapshot_reference(principal, pn) == Some(dependent)
        })
    }

    /// The principal side let go of `dependent`.
    fn release(&mut self, dependent: EntryId, fk_idx: usize, principal: EntryId) {
        if matches!(
            self.sm.state(dependent),
            EntityState::Detached | EntityState::Deleted
        ) {
            return;
        }
        if !self.is_related(dependent, fk_idx, principal) {
            return;
        }
        self.sever(dependent, fk_idx, Some(principal));
    }

    /// Cut `dependent` loose from its principal. Optional relationships get a
    /// NULL foreign key; required ones become orphan candidates.
    fn sever(&mut self, dependent: EntryId, fk_idx: usize, former: Option<EntryId>) {
        if matches!(
            self.sm.state(dependent),
            EntityState::Detached | EntityState::Deleted
        ) {
            return;
        }
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key_at(fk_idx);
        if let Some(dn) = self.dependent_nav(fk_idx) {
            self.set_reference(dependent, dn, None);
        }
        let dep_type = model.entity_type_at(fk.dependent_index());
        let nullable = !fk.required
            && fk
                .property_indices()
                .iter()
                .all(|idx| dep_type.property_at(*idx).nullable);
        if nullable {
            let nulls = vec![Value::Null; fk.property_indices().len()];
            self.sm.write_values(dependent, fk.property_indices(), &nulls);
            self.record_foreign_key(dependent, fk_idx);
        } else if let Some(principal) = former {
            self.orphans.push((dependent, fk_idx, principal));
        }
    }

    fn delete_orphans(&mut self) -> Result<()> {
        let orphans = std::mem::take(&mut self.orphans);
        if !self.sm.config().delete_orphans {
            return Ok(());
        }
        for (dependent, fk_idx, former) in orphans {
            if matches!(
                self.sm.state(dependent),
                EntityState::Detached | EntityState::Deleted
            ) {
                continue;
            }
            // Foreign key values still name the former principal; only the
            // navigations tell whether the pair was joined again.
            let Some(d_id) = self.entity_id(dependent) else {
                continue;
            };
            if self.in_inverse(former, fk_idx, d_id) {
                continue;
            }
            if let Some(dn) = self.dependent_nav(fk_idx) {
                if self.snapshot_reference(dependent, dn).is_some() {
                    continue;
                }
            }
            let fk = self.model.foreign_key_at(fk_idx);
            let values = self.sm.values_at(dependent, fk.property_indices());
            let reparented = EntityKey::assigned(fk.principal_index(), values)
                .and_then(|k| self.sm.find_by_key(&k))
                .is_some_and(|p| p != former);
            if reparented {
                continue;
            }
            tracing::debug!(
                entity_type = self.model.entity_type_at(fk.dependent_index()).name(),
                entry = dependent.as_usize(),
                "Deleting orphaned dependent"
            );
            self.delete(dependent)?;
        }
        Ok(())
    }

    // ========================================================================
    // Tracking, deletion, keys
    // ========================================================================

    /// Track an entity reached through a navigation, choosing its state by the
    /// key heuristic.
    fn ensure_tracked(&mut self, entity: EntityRef) -> Result<EntryId> {
        if let Some(id) = self.sm.entry_id_of(&entity) {
            return Ok(id);
        }
        let type_index = self.sm.resolve_type(&entity)?;
        let et = self.model.entity_type_at(type_index);
        let state = graph_attacher::state_for_reachable(&entity, et);
        let id = self.sm.start_tracking(entity, type_index, state, false)?;
        self.pending.push_back((id, true));
        Ok(id)
    }

    /// Collect tracked dependents whose foreign key matches this principal.
    fn collect_dependents(&mut self, principal: EntryId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let (Some(type_index), Some(p_id)) = (self.sm.type_index(principal), self.entity_id(principal))
        else {
            return Ok(());
        };
        for &fk_idx in model.entity_type_at(type_index).referencing_foreign_keys() {
            let fk = model.foreign_key_at(fk_idx);
            let key_values = self.sm.values_at(principal, fk.principal_key_indices());
            if EntityKey::assigned(type_index, key_values.clone()).is_none() {
                continue;
            }
            let dn = self.dependent_nav(fk_idx);
            for dependent in self.sm.ids_of_type(fk.dependent_index()) {
                if self.sm.state(dependent) == EntityState::Deleted {
                    continue;
                }
                let values = self.sm.values_at(dependent, fk.property_indices());
                if !same_values(&values, &key_values) {
                    continue;
                }
                let elsewhere = dn
                    .and_then(|dn| self.snapshot_reference(dependent, dn))
                    .is_some_and(|t| t != p_id);
                if !elsewhere {
                    self.relate(dependent, fk_idx, principal)?;
                }
            }
        }
        Ok(())
    }

    /// Mark an entry Deleted (or detach it if Added) and cascade to tracked
    /// dependents.
    pub(crate) fn delete(&mut self, id: EntryId) -> Result<()> {
        if !self.deleting.insert(id) {
            return Ok(());
        }
        match self.sm.state(id) {
            EntityState::Detached | EntityState::Deleted => Ok(()),
            EntityState::Added => {
                self.cascade(id)?;
                self.detach_with_fixup(id);
                Ok(())
            }
            EntityState::Unchanged | EntityState::Modified => {
                self.sm.change_state(id, EntityState::Deleted);
                self.cascade(id)
            }
        }
    }

    fn cascade(&mut self, principal: EntryId) -> Result<()> {
        if !self.sm.config().cascade_delete {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let Some(type_index) = self.sm.type_index(principal) else {
            return Ok(());
        };
        for &fk_idx in model.entity_type_at(type_index).referencing_foreign_keys() {
            let fk = model.foreign_key_at(fk_idx);
            let dependents: Vec<EntryId> = self
                .sm
                .ids_of_type(fk.dependent_index())
                .into_iter()
                .filter(|d| *d != principal)
                .filter(|d| {
                    !matches!(
                        self.sm.state(*d),
                        EntityState::Detached | EntityState::Deleted
                    )
                })
                .filter(|d| self.is_related(*d, fk_idx, principal))
                .collect();
            for dependent in dependents {
                match fk.delete_behavior {
                    DeleteBehavior::Cascade => {
                        tracing::debug!(
                            entity_type = model.entity_type_at(fk.dependent_index()).name(),
                            entry = dependent.as_usize(),
                            "Cascading delete"
                        );
                        self.delete(dependent)?;
                    }
                    DeleteBehavior::ClientSetNull => {
                        let dep_type = model.entity_type_at(fk.dependent_index());
                        let nullable = fk
                            .property_indices()
                            .iter()
                            .all(|idx| dep_type.property_at(*idx).nullable);
                        if nullable {
                            let nulls = vec![Value::Null; fk.property_indices().len()];
                            self.sm.write_values(dependent, fk.property_indices(), &nulls);
                            self.record_foreign_key(dependent, fk_idx);
                            if let Some(dn) = self.dependent_nav(fk_idx) {
                                self.set_reference(dependent, dn, None);
                            }
                            self.remove_from_principal(principal, fk_idx, dependent);
                        }
                    }
                    DeleteBehavior::Restrict => {}
                }
            }
        }
        Ok(())
    }

    /// Discard an entry and drop it from tracked entities' navigations.
    pub(crate) fn detach_with_fixup(&mut self, id: EntryId) {
        let model = Arc::clone(&self.model);
        let (Some(target), Some(target_id)) = (self.sm.entity(id), self.entity_id(id)) else {
            return;
        };
        for other in self.sm.ids() {
            if other == id {
                continue;
            }
            let Some(type_index) = self.sm.type_index(other) else {
                continue;
            };
            for (ni, nav) in model.entity_type_at(type_index).navigations().iter().enumerate() {
                if nav.is_collection {
                    if self.snapshot_collection(other, ni).contains(&target_id) {
                        self.remove_member(other, ni, &target);
                    }
                } else if self.snapshot_reference(other, ni) == Some(target_id) {
                    self.set_reference(other, ni, None);
                }
            }
        }
        self.sm.stop_tracking(id);
    }

    /// Copy a principal's (new) key into the foreign keys of its tracked
    /// dependents.
    pub(crate) fn propagate_key(&mut self, principal: EntryId, old_key: Option<&[Value]>) {
        let model = Arc::clone(&self.model);
        let (Some(type_index), Some(p_id)) = (self.sm.type_index(principal), self.entity_id(principal))
        else {
            return;
        };
        for &fk_idx in model.entity_type_at(type_index).referencing_foreign_keys() {
            let fk = model.foreign_key_at(fk_idx);
            let new_key = self.sm.values_at(principal, fk.principal_key_indices());
            let dn = self.dependent_nav(fk_idx);
            let pn = self.principal_nav(fk_idx);
            for dependent in self.sm.ids_of_type(fk.dependent_index()) {
                let Some(d_id) = self.entity_id(dependent) else {
                    continue;
                };
                let by_nav = dn.is_some_and(|dn| self.snapshot_reference(dependent, dn) == Some(p_id));
                let by_inverse = pn.is_some_and(|pn| {
                    self.snapshot_collection(principal, pn).contains(&d_id)
                        || self.snapshot_reference(principal, pn) == Some(d_id)
                });
                let by_value = old_key.is_some_and(|old| {
                    EntityKey::assigned(type_index, old.to_vec()).is_some()
                        && same_values(&self.sm.values_at(dependent, fk.property_indices()), old)
                });
                if by_nav || by_inverse || by_value {
                    self.sm.write_values(dependent, fk.property_indices(), &new_key);
                    self.record_foreign_key(dependent, fk_idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionConfig;
    use ormtrack_core::{
        DynamicEntity, EntityType, ForeignKey, Property, ValueGenerated, ValueKind, contains_entity,
    };

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

    fn node(id: i64, parent: Option<i64>) -> EntityRef {
        DynamicEntity::new("Node")
            .with("id", id)
            .with("parent_id", parent.map_or(Value::Null, Value::BigInt))
            .into_ref()
    }

    fn track(sm: &mut StateManager, entity: &EntityRef, state: EntityState) -> EntryId {
        sm.start_tracking(entity.clone(), 0, state, false).unwrap()
    }

    #[test]
    fn test_foreign_key_value_links_navigations() {
        let mut sm = manager();
        let parent = node(1, None);
        let child = node(2, Some(1));
        let p = track(&mut sm, &parent, EntityState::Unchanged);
        let c = track(&mut sm, &child, EntityState::Unchanged);
        NavigationFixer::new(&mut sm).fixup_new([p, c]).unwrap();

        let linked = child.borrow().reference("parent").unwrap();
        assert_eq!(EntityId::of(&linked), EntityId::of(&parent));
        assert!(contains_entity(&parent.borrow().collection("children"), &child));
        assert_eq!(sm.state(c), EntityState::Unchanged);
    }

    #[test]
    fn test_reference_fills_foreign_key_of_added_dependent() {
        let mut sm = manager();
        let parent = node(1, None);
        let child = node(0, None);
        child.borrow_mut().set_reference("parent", Some(parent.clone()));
        let p = track(&mut sm, &parent, EntityState::Unchanged);
        let c = track(&mut sm, &child, EntityState::Added);
        NavigationFixer::new(&mut sm).fixup_new([p, c]).unwrap();

        assert_eq!(child.borrow().get_value("parent_id"), Some(Value::BigInt(1)));
        assert!(contains_entity(&parent.borrow().collection("children"), &child));
        assert_eq!(sm.state(c), EntityState::Added);
    }

    #[test]
    fn test_deleting_principal_nulls_optional_dependents() {
        let mut sm = manager();
        let parent = node(1, None);
        let child = node(2, Some(1));
        let p = track(&mut sm, &parent, EntityState::Unchanged);
        let c = track(&mut sm, &child, EntityState::Unchanged);
        let mut fixer = NavigationFixer::new(&mut sm);
        fixer.fixup_new([p, c]).unwrap();
        fixer.delete(p).unwrap();
        drop(fixer);

        assert_eq!(sm.state(p), EntityState::Deleted);
        // Promoted to Modified by the next detection pass.
        assert_eq!(sm.state(c), EntityState::Unchanged);
        assert_eq!(child.borrow().get_value("parent_id"), Some(Value::Null));
        assert!(child.borrow().reference("parent").is_none());
        assert!(parent.borrow().collection("children").is_empty());
    }

    #[test]
    fn test_deleting_added_entry_detaches_it() {
        let mut sm = manager();
        let parent = node(1, None);
        let child = node(0, None);
        child.borrow_mut().set_reference("parent", Some(parent.clone()));
        let p = track(&mut sm, &parent, EntityState::Unchanged);
        let c = track(&mut sm, &child, EntityState::Added);
        let mut fixer = NavigationFixer::new(&mut sm);
        fixer.fixup_new([p, c]).unwrap();
        fixer.delete(c).unwrap();
        drop(fixer);

        assert_eq!(sm.state(c), EntityState::Detached);
        assert_eq!(sm.state(p), EntityState::Unchanged);
        assert!(parent.borrow().collection("children").is_empty());
    }

    #[test]
    fn test_new_key_flows_to_dependents() {
        let mut sm = manager();
        let parent = node(0, None);
        let child = node(0, None);
        child.borrow_mut().set_reference("parent", Some(parent.clone()));
        let p = track(&mut sm, &parent, EntityState::Added);
        let c = track(&mut sm, &child, EntityState::Added);
        NavigationFixer::new(&mut sm).fixup_new([p, c]).unwrap();

        sm.write_values(p, &[0], &[Value::BigInt(9)]);
        sm.rekey(p).unwrap();
        NavigationFixer::new(&mut sm).propagate_key(p, Some(&[Value::BigInt(0)]));
        assert_eq!(child.borrow().get_value("parent_id"), Some(Value::BigInt(9)));
    }
}
