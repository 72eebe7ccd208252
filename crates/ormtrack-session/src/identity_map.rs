//! Identity map: one tracked entry per (entity type, key).
//!
//! Only entities whose key is fully assigned occupy a slot. Entities with an
//! unassigned (default) key component are tracked without one and cannot be
//! identity-resolved until the key is generated or set.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ormtrack_core::{Value, hash_values};

use crate::entry::EntryId;

/// Identity of a row: entity type index plus key values.
#[derive(Debug, Clone)]
pub struct EntityKey {
    type_index: usize,
    values: Vec<Value>,
}

impl EntityKey {
    /// Build a key. Returns `None` if any component holds a default value.
    pub fn assigned(type_index: usize, values: Vec<Value>) -> Option<Self> {
        if values.is_empty() || values.iter().any(Value::is_default) {
            return None;
        }
        Some(Self { type_index, values })
    }

    /// Entity type index.
    pub fn type_index(&self) -> usize {
        self.type_index
    }

    /// Key values in key-property order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_index == other.type_index
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.same_as(b))
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_index.hash(state);
        state.write_u64(hash_values(&self.values));
    }
}

/// Maps identities to entries.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    slots: HashMap<EntityKey, EntryId>,
}

impl IdentityMap {
    /// Look up an identity. Not finding one is not an error.
    pub(crate) fn find(&self, key: &EntityKey) -> Option<EntryId> {
        self.slots.get(key).copied()
    }

    /// Claim a slot. Fails with the current holder if another entry owns it.
    pub(crate) fn insert(&mut self, key: EntityKey, id: EntryId) -> Result<(), EntryId> {
        match self.slots.get(&key) {
            Some(existing) if *existing != id => Err(*existing),
            _ => {
                self.slots.insert(key, id);
                Ok(())
            }
        }
    }

    /// Release a slot if `id` holds it.
    pub(crate) fn remove(&mut self, key: &EntityKey, id: EntryId) {
        if self.slots.get(key) == Some(&id) {
            self.slots.remove(key);
        }
    }

    /// Move `id` from `old` to `new`. On conflict nothing changes.
    pub(crate) fn rekey(
        &mut self,
        old: Option<&EntityKey>,
        new: Option<EntityKey>,
        id: EntryId,
    ) -> Result<(), EntryId> {
        if let Some(new_key) = &new {
            if let Some(existing) = self.find(new_key) {
                if existing != id {
                    return Err(existing);
                }
            }
        }
        if let Some(old_key) = old {
            self.remove(old_key, id);
        }
        if let Some(new_key) = new {
            self.slots.insert(new_key, id);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> EntityKey {
        EntityKey::assigned(0, vec![Value::BigInt(v)]).unwrap()
    }

    #[test]
    fn test_default_components_are_unassigned() {
        assert!(EntityKey::assigned(0, vec![Value::BigInt(0)]).is_none());
        assert!(EntityKey::assigned(0, vec![Value::BigInt(1), Value::Null]).is_none());
        assert!(EntityKey::assigned(0, vec![]).is_none());
    }

    #[test]
    fn test_keys_differ_by_type() {
        let a = EntityKey::assigned(0, vec![Value::BigInt(1)]).unwrap();
        let b = EntityKey::assigned(1, vec![Value::BigInt(1)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_composite_keys_find_their_slot() {
        let composite = |a: i64, b: &str| {
            EntityKey::assigned(0, vec![Value::BigInt(a), Value::Text(b.into())]).unwrap()
        };
        let mut map = IdentityMap::default();
        map.insert(composite(1, "x"), EntryId::from_raw(1)).unwrap();
        map.insert(composite(1, "y"), EntryId::from_raw(2)).unwrap();
        assert_eq!(map.find(&composite(1, "x")), Some(EntryId::from_raw(1)));
        assert_eq!(map.find(&composite(1, "y")), Some(EntryId::from_raw(2)));
        assert_eq!(map.find(&composite(2, "x")), None);
    }

    #[test]
    fn test_insert_reports_existing_holder() {
        let mut map = IdentityMap::default();
        map.insert(key(1), EntryId::from_raw(1)).unwrap();
        assert!(map.insert(key(1), EntryId::from_raw(1)).is_ok());
        assert_eq!(
            map.insert(key(1), EntryId::from_raw(2)),
            Err(EntryId::from_raw(1))
        );
        assert_eq!(map.find(&key(1)), Some(EntryId::from_raw(1)));
    }

    #[test]
    fn test_rekey_moves_slot() {
        let mut map = IdentityMap::default();
        let id = EntryId::from_raw(1);
        map.insert(key(1), id).unwrap();
        map.rekey(Some(&key(1)), Some(key(2)), id).unwrap();
        assert_eq!(map.find(&key(1)), None);
        assert_eq!(map.find(&key(2)), Some(id));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rekey_conflict_leaves_map_untouched() {
        let mut map = IdentityMap::default();
        map.insert(key(1), EntryId::from_raw(1)).unwrap();
        map.insert(key(2), EntryId::from_raw(2)).unwrap();
        let err = map.rekey(Some(&key(1)), Some(key(2)), EntryId::from_raw(1));
        assert_eq!(err, Err(EntryId::from_raw(2)));
        assert_eq!(map.find(&key(1)), Some(EntryId::from_raw(1)));
    }

    #[test]
    fn test_remove_only_by_holder() {
        let mut map = IdentityMap::default();
        map.insert(key(1), EntryId::from_raw(1)).unwrap();
        map.remove(&key(1), EntryId::from_raw(9));
        assert_eq!(map.len(), 1);
        map.remove(&key(1), EntryId::from_raw(1));
        assert_eq!(map.len(), 0);
    }
}
