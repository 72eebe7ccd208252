//! The entity capability interface.
//!
//! The tracker never touches an entity's fields directly. Each entity type
//! implements [`Entity`], which exposes property and navigation access by
//! name, and the tracker drives everything through it. Application code keeps
//! mutating its own objects freely; changes are picked up by snapshot diffing.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::value::Value;

/// Shared handle to a tracked (or trackable) entity instance.
pub type EntityRef = Rc<RefCell<dyn Entity>>;

/// Property and navigation access for one entity instance.
///
/// Scalar accessors return/accept [`Value`]. Navigation accessors deal in
/// [`EntityRef`]s; the tracker identifies related instances by allocation
/// identity, so implementations must hand back the same `Rc` they were given.
pub trait Entity: Any {
    /// Name of the entity type in the model.
    fn entity_type(&self) -> &str;

    /// Read a scalar property. `None` means the property has no backing on
    /// this instance (a shadow property).
    fn get_value(&self, property: &str) -> Option<Value>;

    /// Write a scalar property. Returns `false` if the property has no backing.
    fn set_value(&mut self, property: &str, value: Value) -> bool;

    /// Read a reference navigation.
    fn reference(&self, navigation: &str) -> Option<EntityRef> {
        let _ = navigation;
        None
    }

    /// Write a reference navigation.
    fn set_reference(&mut self, navigation: &str, target: Option<EntityRef>) {
        let _ = (navigation, target);
    }

    /// Read the members of a collection navigation.
    fn collection(&self, navigation: &str) -> Vec<EntityRef> {
        let _ = navigation;
        Vec::new()
    }

    /// Append to a collection navigation.
    fn add_to_collection(&mut self, navigation: &str, item: EntityRef) {
        let _ = (navigation, item);
    }

    /// Remove from a collection navigation. Returns whether the item was present.
    fn remove_from_collection(&mut self, navigation: &str, item: &EntityRef) -> bool {
        let _ = (navigation, item);
        false
    }
}

/// Allocation identity of an entity instance.
///
/// Two handles compare equal iff they point at the same object, regardless of
/// property values. Only meaningful while the instance is alive, which the
/// tracker guarantees by holding a handle for every entity it records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl EntityId {
    /// Identity of the given handle.
    pub fn of(entity: &EntityRef) -> Self {
        Self(Rc::as_ptr(entity).cast::<()>() as usize)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({:#x})", self.0)
    }
}

/// Whether a collection of handles contains `item` by identity.
pub fn contains_entity(items: &[EntityRef], item: &EntityRef) -> bool {
    items.iter().any(|e| Rc::ptr_eq(e, item))
}

/// Upcast a typed handle.
pub fn entity_ref<T: Entity>(entity: &Rc<RefCell<T>>) -> EntityRef {
    entity.clone()
}
