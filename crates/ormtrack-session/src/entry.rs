//! Tracked entries.

use std::fmt;

use ormtrack_core::{EntityId, EntityRef, EntityType, FieldsSet, Value};

use crate::identity_map::EntityKey;
use crate::state::EntityState;

/// Stable handle of a tracked entry. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

impl EntryId {
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw slot number.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Last relationship state the navigation fixer made consistent.
///
/// Navigation vectors are indexed like `EntityType::navigations()`,
/// foreign-key vectors like `EntityType::foreign_keys()`.
#[derive(Debug, Clone)]
pub(crate) struct RelationshipSnapshot {
    pub(crate) references: Vec<Option<EntityId>>,
    pub(crate) collections: Vec<Vec<EntityId>>,
    pub(crate) foreign_keys: Vec<Option<Vec<Value>>>,
}

impl RelationshipSnapshot {
    /// An empty snapshot: every navigation unset, every foreign key unknown.
    pub(crate) fn empty(entity_type: &EntityType) -> Self {
        let navs = entity_type.navigations().len();
        Self {
            references: vec![None; navs],
            collections: vec![Vec::new(); navs],
            foreign_keys: vec![None; entity_type.foreign_keys().len()],
        }
    }

    pub(crate) fn forget(&mut self, entity: EntityId) {
        for r in &mut self.references {
            if *r == Some(entity) {
                *r = None;
            }
        }
        for c in &mut self.collections {
            c.retain(|e| *e != entity);
        }
    }
}

/// The tracker's bookkeeping record for one entity instance.
pub(crate) struct TrackedEntry {
    pub(crate) entity: EntityRef,
    pub(crate) entity_id: EntityId,
    pub(crate) type_index: usize,
    pub(crate) state: EntityState,
    /// Values as of the last load/save; `None` while Added.
    pub(crate) original: Option<Vec<Value>>,
    /// Values of properties the entity does not back.
    pub(crate) shadow: Vec<Value>,
    pub(crate) explicit_modified: FieldsSet,
    pub(crate) detected_modified: FieldsSet,
    /// Identity-map slot currently held.
    pub(crate) key: Option<EntityKey>,
    pub(crate) relationships: RelationshipSnapshot,
}

impl TrackedEntry {
    pub(crate) fn new(entity: EntityRef, type_index: usize, entity_type: &EntityType) -> Self {
        let entity_id = EntityId::of(&entity);
        let count = entity_type.properties().len();
        Self {
            entity,
            entity_id,
            type_index,
            state: EntityState::Detached,
            original: None,
            shadow: entity_type
                .properties()
                .iter()
                .map(|p| p.initial_value())
                .collect(),
            explicit_modified: FieldsSet::empty(count),
            detected_modified: FieldsSet::empty(count),
            key: None,
            relationships: RelationshipSnapshot::empty(entity_type),
        }
    }

    /// Current value of a property: entity-backed if the entity has it,
    /// otherwise the shadow store.
    pub(crate) fn current_value(&self, entity_type: &EntityType, index: usize) -> Value {
        let property = entity_type.property_at(index);
        if !property.shadow {
            if let Some(v) = self.entity.borrow().get_value(&property.name) {
                return v;
            }
        }
        self.shadow[index].clone()
    }

    pub(crate) fn current_values(&self, entity_type: &EntityType) -> Vec<Value> {
        (0..entity_type.properties().len())
            .map(|idx| self.current_value(entity_type, idx))
            .collect()
    }

    pub(crate) fn values_at(&self, entity_type: &EntityType, indices: &[usize]) -> Vec<Value> {
        indices
            .iter()
            .map(|idx| self.current_value(entity_type, *idx))
            .collect()
    }

    /// Write a property. Returns whether the value changed.
    pub(crate) fn write_value(&mut self, entity_type: &EntityType, index: usize, value: Value) -> bool {
        if self.current_value(entity_type, index).same_as(&value) {
            return false;
        }
        let property = entity_type.property_at(index);
        if !property.shadow
            && self
                .entity
                .borrow_mut()
                .set_value(&property.name, value.clone())
        {
            return true;
        }
        self.shadow[index] = value;
        true
    }

    pub(crate) fn original_value(&self, index: usize) -> Option<&Value> {
        self.original.as_ref().and_then(|o| o.get(index))
    }

    pub(crate) fn is_property_modified(&self, index: usize) -> bool {
        self.explicit_modified.is_set(index) || self.detected_modified.is_set(index)
    }

    pub(crate) fn any_modified(&self) -> bool {
        self.explicit_modified.any() || self.detected_modified.any()
    }

    pub(crate) fn clear_modified(&mut self) {
        self.explicit_modified.clear();
        self.detected_modified.clear();
    }

    pub(crate) fn view(&self, id: EntryId, entity_type: &EntityType) -> EntryView {
        let names = entity_type.properties().iter().map(|p| p.name.clone());
        let current_values = names
            .clone()
            .zip(self.current_values(entity_type))
            .collect();
        let original_values = self
            .original
            .as_ref()
            .map(|o| names.clone().zip(o.iter().cloned()).collect());
        let modified_properties = (0..entity_type.properties().len())
            .filter(|idx| self.is_property_modified(*idx))
            .map(|idx| entity_type.property_at(idx).name.clone())
            .collect();
        EntryView {
            id,
            entity: self.entity.clone(),
            entity_type: entity_type.name().to_string(),
            state: self.state,
            current_values,
            original_values,
            modified_properties,
        }
    }
}

/// Read-only snapshot of a tracked entry, handed out to callers.
#[derive(Clone)]
pub struct EntryView {
    /// Entry handle.
    pub id: EntryId,
    /// The tracked instance.
    pub entity: EntityRef,
    /// Entity type name.
    pub entity_type: String,
    /// Current state.
    pub state: EntityState,
    /// Current property values, in declaration order.
    pub current_values: Vec<(String, Value)>,
    /// Original property values; `None` while Added.
    pub original_values: Option<Vec<(String, Value)>>,
    /// Names of properties flagged modified.
    pub modified_properties: Vec<String>,
}

impl EntryView {
    /// Current value of a property.
    pub fn current(&self, property: &str) -> Option<&Value> {
        self.current_values
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, v)| v)
    }

    /// Original value of a property.
    pub fn original(&self, property: &str) -> Option<&Value> {
        self.original_values
            .as_ref()?
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, v)| v)
    }

    /// Whether a property is flagged modified.
    pub fn is_modified(&self, property: &str) -> bool {
        self.modified_properties.iter().any(|p| p == property)
    }
}

impl fmt::Debug for EntryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryView")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type)
            .field("state", &self.state)
            .field("current_values", &self.current_values)
            .field("original_values", &self.original_values)
            .field("modified_properties", &self.modified_properties)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormtrack_core::{DynamicEntity, Property, ValueKind};

    fn blog_type() -> EntityType {
        EntityType::new("Blog")
            .property(Property::new("id", ValueKind::BigInt).key())
            .property(Property::new("name", ValueKind::Text))
            .property(Property::new("created", ValueKind::Timestamp).shadow())
    }

    #[test]
    fn test_unbacked_property_reads_shadow() {
        let et = blog_type();
        let blog = DynamicEntity::new("Blog").with("id", 1_i64).into_ref();
        let entry = TrackedEntry::new(blog, 0, &et);
        assert_eq!(entry.current_value(&et, 0), Value::BigInt(1));
        // "name" has no backing yet, so the zero value from the shadow store.
        assert_eq!(entry.current_value(&et, 1), Value::Text(String::new()));
        assert_eq!(entry.current_value(&et, 2), Value::Timestamp(0));
    }

    #[test]
    fn test_shadow_write_never_reaches_entity() {
        let et = blog_type();
        let blog = DynamicEntity::new("Blog").with("id", 1_i64).into_ref();
        let mut entry = TrackedEntry::new(blog.clone(), 0, &et);
        assert!(entry.write_value(&et, 2, Value::Timestamp(42)));
        assert_eq!(blog.borrow().get_value("created"), None);
        assert_eq!(entry.current_value(&et, 2), Value::Timestamp(42));
        assert!(!entry.write_value(&et, 2, Value::Timestamp(42)));
    }

    #[test]
    fn test_view_lists_modified_properties() {
        let et = blog_type();
        let blog = DynamicEntity::new("Blog")
            .with("id", 1_i64)
            .with("name", "A")
            .into_ref();
        let mut entry = TrackedEntry::new(blog, 0, &et);
        entry.state = EntityState::Modified;
        entry.original = Some(entry.current_values(&et));
        entry.detected_modified.set(1);
        let view = entry.view(EntryId::from_raw(3), &et);
        assert_eq!(view.id.as_usize(), 3);
        assert!(view.is_modified("name"));
        assert!(!view.is_modified("id"));
        assert_eq!(view.original("name"), Some(&Value::Text("A".into())));
        assert_eq!(view.current("id"), Some(&Value::BigInt(1)));
    }
}
