//! Save coordination: plan the write batch, then apply gateway results.
//!
//! The batch holds inserts first (principals before dependents), then updates,
//! then deletes (dependents before principals). Results are validated in full
//! before any entry is touched, so a failing save leaves every entry as it was.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use ormtrack_core::{Error, Model, Result, StorageError, Value};

use crate::entry::EntryId;
use crate::gateway::{KeyPropagation, WriteBatch, WriteCommand, WriteKind, WriteResult};
use crate::identity_map::EntityKey;
use crate::navigation_fixer::NavigationFixer;
use crate::state::EntityState;
use crate::state_manager::{StateManager, same_values};

/// An ordered batch and the entry behind each command.
#[derive(Debug, Default)]
pub(crate) struct SavePlan {
    pub(crate) batch: WriteBatch,
    pub(crate) entries: Vec<EntryId>,
}

impl SavePlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Principal `dependent` currently refers to through `fk_idx`, if tracked.
fn principal_of(sm: &StateManager, model: &Model, dependent: EntryId, fk_idx: usize) -> Option<EntryId> {
    let fk = model.foreign_key_at(fk_idx);
    let entry = sm.entry(dependent)?;
    let dep_type = model.entity_type_at(entry.type_index);

    if let Some(name) = fk.dependent_navigation.as_deref() {
        let target = dep_type
            .navigations()
            .iter()
            .position(|n| n.name == name)
            .and_then(|ni| entry.relationships.references.get(ni).copied().flatten())
            .and_then(|t| sm.lookup(t));
        if target.is_some() {
            return target;
        }
    }

    let values = entry.values_at(dep_type, fk.property_indices());
    if let Some(p) = EntityKey::assigned(fk.principal_index(), values).and_then(|k| sm.find_by_key(&k)) {
        return Some(p);
    }

    let name = fk.principal_navigation.as_deref()?;
    let pn = model
        .entity_type_at(fk.principal_index())
        .navigations()
        .iter()
        .position(|n| n.name == name)?;
    let member = entry.entity_id;
    sm.ids_of_type(fk.principal_index()).into_iter().find(|p| {
        sm.entry(*p).is_some_and(|pe| {
            pe.relationships
                .collections
                .get(pn)
                .is_some_and(|c| c.contains(&member))
                || pe.relationships.references.get(pn).copied().flatten() == Some(member)
        })
    })
}

/// Order `set` so principals come before their dependents. Ties break on
/// entry id, which follows tracking order.
fn topological_order(sm: &StateManager, model: &Model, set: &[EntryId]) -> Result<Vec<EntryId>> {
    let members: HashSet<EntryId> = set.iter().copied().collect();
    let mut indegree: BTreeMap<EntryId, usize> = set.iter().map(|id| (*id, 0)).collect();
    let mut edges: HashMap<EntryId, Vec<EntryId>> = HashMap::new();

    for &dependent in set {
        let Some(type_index) = sm.type_index(dependent) else {
            continue;
        };
        for &fk_idx in model.entity_type_at(type_index).foreign_keys() {
            let Some(principal) = principal_of(sm, model, dependent, fk_idx) else {
                continue;
            };
            if principal == dependent || !members.contains(&principal) {
                continue;
            }
            let out = edges.entry(principal).or_default();
            if !out.contains(&dependent) {
                out.push(dependent);
                if let Some(d) = indegree.get_mut(&dependent) {
                    *d += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<EntryId>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut ordered = Vec::with_capacity(set.len());
    while let Some(Reverse(id)) = ready.pop() {
        ordered.push(id);
        for next in edges.get(&id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    if ordered.len() != set.len() {
        let mut entity_types: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .filter_map(|(id, _)| sm.type_index(*id))
            .map(|t| model.entity_type_at(t).name().to_string())
            .collect();
        entity_types.sort();
        entity_types.dedup();
        tracing::warn!(?entity_types, "Write order has a dependency cycle");
        return Err(Error::CyclicDependency { entity_types });
    }
    Ok(ordered)
}

fn named(model: &Model, type_index: usize, indices: &[usize], values: &[Value]) -> Vec<(String, Value)> {
    let et = model.entity_type_at(type_index);
    indices
        .iter()
        .zip(values)
        .map(|(idx, v)| (et.property_at(*idx).name.clone(), v.clone()))
        .collect()
}

fn original_tokens(sm: &StateManager, model: &Model, id: EntryId) -> Vec<(String, Value)> {
    let Some(entry) = sm.entry(id) else {
        return Vec::new();
    };
    model
        .entity_type_at(entry.type_index)
        .properties()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.concurrency_token)
        .filter_map(|(idx, p)| entry.original_value(idx).map(|v| (p.name.clone(), v.clone())))
        .collect()
}

/// Foreign keys whose principal is inserted earlier in the batch with a
/// store-generated key.
fn key_propagations(
    sm: &StateManager,
    model: &Model,
    id: EntryId,
    inserted: &HashMap<EntryId, usize>,
    batch: &WriteBatch,
) -> Vec<KeyPropagation> {
    let Some(type_index) = sm.type_index(id) else {
        return Vec::new();
    };
    let et = model.entity_type_at(type_index);
    let mut propagations = Vec::new();
    for &fk_idx in et.foreign_keys() {
        let fk = model.foreign_key_at(fk_idx);
        let Some(principal) = principal_of(sm, model, id, fk_idx) else {
            continue;
        };
        let Some(&position) = inserted.get(&principal) else {
            continue;
        };
        let principal_generates_key = batch.commands[position]
            .generated
            .iter()
            .any(|g| {
                fk.principal_key_indices()
                    .iter()
                    .any(|k| model.entity_type_at(fk.principal_index()).property_at(*k).name == *g)
            });
        if principal_generates_key {
            let principal_type = model.entity_type_at(fk.principal_index());
            propagations.push(KeyPropagation {
                properties: fk.properties.clone(),
                principal_command: position,
                principal_properties: fk
                    .principal_key_indices()
                    .iter()
                    .map(|k| principal_type.property_at(*k).name.clone())
                    .collect(),
            });
        }
    }
    propagations
}

fn insert_command(
    sm: &StateManager,
    model: &Model,
    id: EntryId,
    inserted: &HashMap<EntryId, usize>,
    batch: &WriteBatch,
) -> Option<WriteCommand> {
    let entry = sm.entry(id)?;
    let et = model.entity_type_at(entry.type_index);
    let current = entry.current_values(et);

    let generated: Vec<usize> = et
        .properties()
        .iter()
        .enumerate()
        .filter(|(idx, p)| p.generated_on_update() || (p.generated_on_add() && current[*idx].is_default()))
        .map(|(idx, _)| idx)
        .collect();
    let values: Vec<usize> = (0..current.len())
        .filter(|idx| !et.property_at(*idx).key && !generated.contains(idx))
        .collect();

    Some(WriteCommand {
        kind: WriteKind::Insert,
        entity_type: et.name().to_string(),
        key: et
            .key_indices()
            .iter()
            .map(|idx| (et.property_at(*idx).name.clone(), current[*idx].clone()))
            .collect(),
        values: values
            .iter()
            .map(|idx| (et.property_at(*idx).name.clone(), current[*idx].clone()))
            .collect(),
        original_tokens: Vec::new(),
        generated: generated
            .iter()
            .map(|idx| et.property_at(*idx).name.clone())
            .collect(),
        key_propagations: key_propagations(sm, model, id, inserted, batch),
    })
}

fn update_command(
    sm: &StateManager,
    model: &Model,
    id: EntryId,
    inserted: &HashMap<EntryId, usize>,
    batch: &WriteBatch,
) -> Option<WriteCommand> {
    let entry = sm.entry(id)?;
    let et = model.entity_type_at(entry.type_index);
    let key = sm.key_values(id);
    let values = et
        .properties()
        .iter()
        .enumerate()
        .filter(|(idx, p)| !p.key && !p.generated_on_update() && entry.is_property_modified(*idx))
        .map(|(idx, p)| (p.name.clone(), entry.current_value(et, idx)))
        .collect();
    Some(WriteCommand {
        kind: WriteKind::Update,
        entity_type: et.name().to_string(),
        key: named(model, entry.type_index, et.key_indices(), &key),
        values,
        original_tokens: original_tokens(sm, model, id),
        generated: et
            .properties()
            .iter()
            .filter(|p| p.generated_on_update())
            .map(|p| p.name.clone())
            .collect(),
        key_propagations: key_propagations(sm, model, id, inserted, batch),
    })
}

fn delete_command(sm: &StateManager, model: &Model, id: EntryId) -> Option<WriteCommand> {
    let entry = sm.entry(id)?;
    let et = model.entity_type_at(entry.type_index);
    let key = sm.key_values(id);
    Some(WriteCommand {
        kind: WriteKind::Delete,
        entity_type: et.name().to_string(),
        key: named(model, entry.type_index, et.key_indices(), &key),
        values: Vec::new(),
        original_tokens: original_tokens(sm, model, id),
        generated: Vec::new(),
        key_propagations: Vec::new(),
    })
}

/// Partition the write set and build the ordered batch.
pub(crate) fn plan_save(sm: &StateManager) -> Result<SavePlan> {
    let model = Arc::clone(sm.model());
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();
    for id in sm.ids() {
        match sm.state(id) {
            EntityState::Added => added.push(id),
            EntityState::Modified => modified.push(id),
            EntityState::Deleted => deleted.push(id),
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }

    let inserts = topological_order(sm, &model, &added)?;
    let mut deletes = topological_order(sm, &model, &deleted)?;
    deletes.reverse();

    let mut plan = SavePlan::default();
    let mut inserted = HashMap::new();
    for id in inserts {
        if let Some(cmd) = insert_command(sm, &model, id, &inserted, &plan.batch) {
            inserted.insert(id, plan.batch.commands.len());
            plan.batch.commands.push(cmd);
            plan.entries.push(id);
        }
    }
    for id in modified {
        if let Some(cmd) = update_command(sm, &model, id, &inserted, &plan.batch) {
            plan.batch.commands.push(cmd);
            plan.entries.push(id);
        }
    }
    for id in deletes {
        if let Some(cmd) = delete_command(sm, &model, id) {
            plan.batch.commands.push(cmd);
            plan.entries.push(id);
        }
    }
    Ok(plan)
}

/// Check gateway results. Nothing is mutated.
fn validate_results(sm: &StateManager, plan: &SavePlan, results: &[WriteResult]) -> Result<()> {
    let model = Arc::clone(sm.model());
    for (command, result) in plan.batch.commands.iter().zip(results) {
        match result {
            WriteResult::Success { generated } => {
                let et = model.entity_type(&command.entity_type)?;
                for (name, _) in generated {
                    if et.property_index(name).is_none() {
                        return Err(Error::UnknownProperty {
                            entity_type: command.entity_type.clone(),
                            property: name.clone(),
                        });
                    }
                }
            }
            WriteResult::ConcurrencyConflict => {
                let et = model.entity_type(&command.entity_type)?;
                let values: Vec<Value> = command.key.iter().map(|(_, v)| v.clone()).collect();
                tracing::warn!(
                    entity_type = %command.entity_type,
                    kind = ?command.kind,
                    "Concurrency conflict"
                );
                return Err(Error::ConcurrencyConflict {
                    entity_type: command.entity_type.clone(),
                    key: sm.describe_key(et, &values),
                });
            }
            WriteResult::StorageError(message) => {
                tracing::warn!(
                    entity_type = %command.entity_type,
                    kind = ?command.kind,
                    error = %message,
                    "Storage error"
                );
                return Err(Error::Storage(
                    StorageError::new(message.clone()).for_entity(command.entity_type.clone()),
                ));
            }
        }
    }
    if results.len() != plan.batch.len() {
        return Err(Error::Storage(StorageError::new(format!(
            "gateway returned {} results for {} commands",
            results.len(),
            plan.batch.len()
        ))));
    }
    Ok(())
}

/// Apply a successful batch: write back generated values, re-key inserted
/// entries and, when `accept` is set, accept every written entry.
pub(crate) fn apply_results(
    sm: &mut StateManager,
    plan: &SavePlan,
    results: &[WriteResult],
    accept: bool,
) -> Result<usize> {
    validate_results(sm, plan, results)?;
    let model = Arc::clone(sm.model());

    for ((id, command), result) in plan.entries.iter().zip(&plan.batch.commands).zip(results) {
        let WriteResult::Success { generated } = result else {
            continue;
        };
        if generated.is_empty() {
            continue;
        }
        let Some(type_index) = sm.type_index(*id) else {
            continue;
        };
        let et = model.entity_type_at(type_index);
        let old_key = sm.key_values(*id);
        for (name, value) in generated {
            if let Some(idx) = et.property_index(name) {
                sm.write_values(*id, &[idx], std::slice::from_ref(value));
            }
        }
        if command.kind == WriteKind::Insert && !same_values(&old_key, &sm.key_values(*id)) {
            sm.rekey(*id)?;
            NavigationFixer::new(sm).propagate_key(*id, Some(&old_key));
        }
    }

    if accept {
        for id in &plan.entries {
            accept_entry(sm, *id);
        }
    }
    Ok(plan.entries.len())
}

/// Deleted entries are detached and dropped from navigations; the rest
/// become Unchanged with their current values as originals.
fn accept_entry(sm: &mut StateManager, id: EntryId) {
    if sm.state(id) == EntityState::Deleted {
        NavigationFixer::new(sm).detach_with_fixup(id);
    } else {
        sm.accept_changes(id);
    }
}

/// Accept every tracked entry.
pub(crate) fn accept_all(sm: &mut StateManager) {
    for id in sm.ids() {
        accept_entry(sm, id);
    }
}
