//! Map-backed entities.
//!
//! Provides `DynamicEntity` for entity types whose shape is only known at
//! runtime. It implements [`Entity`] by storing values, references and
//! collections in hash maps.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::entity::{Entity, EntityRef};
use crate::value::Value;

/// A dynamically-shaped entity instance.
///
/// Only properties that have been given a value are backed by the instance;
/// the tracker keeps any other declared property in its own shadow store.
///
/// # Example
///
/// ```
/// use ormtrack_core::dynamic::DynamicEntity;
/// use ormtrack_core::{Entity, Value};
///
/// let mut blog = DynamicEntity::new("Blog")
///     .with("id", 0_i64)
///     .with("name", "Rust blog");
///
/// blog.set("name", "Systems blog");
/// assert_eq!(blog.get_value("name"), Some(Value::Text("Systems blog".into())));
/// assert_eq!(blog.get_value("created"), None);
/// ```
pub struct DynamicEntity {
    entity_type: String,
    values: HashMap<String, Value>,
    references: HashMap<String, EntityRef>,
    collections: HashMap<String, Vec<EntityRef>>,
}

impl DynamicEntity {
    /// Create an empty instance of the given entity type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: HashMap::new(),
            references: HashMap::new(),
            collections: HashMap::new(),
        }
    }

    /// Set a value while building.
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(property.into(), value.into());
        self
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Wrap into a type-erased handle.
    pub fn into_ref(self) -> EntityRef {
        Rc::new(RefCell::new(self))
    }

    /// Set a value.
    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(property.into(), value.into());
    }

    /// Get a value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Remove a value (the property becomes unbacked), returning it.
    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }

    /// Point a reference navigation at `target`.
    pub fn set_ref(&mut self, navigation: impl Into<String>, target: Option<EntityRef>) {
        let navigation = navigation.into();
        match target {
            Some(t) => {
                self.references.insert(navigation, t);
            }
            None => {
                self.references.remove(&navigation);
            }
        }
    }

    /// Current target of a reference navigation.
    pub fn get_ref(&self, navigation: &str) -> Option<&EntityRef> {
        self.references.get(navigation)
    }

    /// Append to a collection navigation.
    pub fn push(&mut self, navigation: impl Into<String>, item: EntityRef) {
        self.collections.entry(navigation.into()).or_default().push(item);
    }

    /// Members of a collection navigation.
    pub fn items(&self, navigation: &str) -> &[EntityRef] {
        self.collections.get(navigation).map_or(&[], Vec::as_slice)
    }
}

impl Entity for DynamicEntity {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn get_value(&self, property: &str) -> Option<Value> {
        self.values.get(property).cloned()
    }

    fn set_value(&mut self, property: &str, value: Value) -> bool {
        self.values.insert(property.to_string(), value);
        true
    }

    fn reference(&self, navigation: &str) -> Option<EntityRef> {
        self.references.get(navigation).cloned()
    }

    fn set_reference(&mut self, navigation: &str, target: Option<EntityRef>) {
        self.set_ref(navigation, target);
    }

    fn collection(&self, navigation: &str) -> Vec<EntityRef> {
        self.items(navigation).to_vec()
    }

    fn add_to_collection(&mut self, navigation: &str, item: EntityRef) {
        let items = self.collections.entry(navigation.to_string()).or_default();
        if !items.iter().any(|e| Rc::ptr_eq(e, &item)) {
            items.push(item);
        }
    }

    fn remove_from_collection(&mut self, navigation: &str, item: &EntityRef) -> bool {
        let Some(items) = self.collections.get_mut(navigation) else {
            return false;
        };
        let before = items.len();
        items.retain(|e| !Rc::ptr_eq(e, item));
        items.len() != before
    }
}

impl fmt::Debug for DynamicEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        let mut s = f.debug_struct(&self.entity_type);
        for name in names {
            s.field(name, &self.values[name]);
        }
        for (name, items) in &self.collections {
            s.field(name, &format_args!("[{} items]", items.len()));
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::entity_ref;

    #[test]
    fn test_dynamic_entity_basic() {
        let mut blog = DynamicEntity::new("Blog").with("id", 1_i64);
        blog.set("name", "Alice");

        assert_eq!(blog.entity_type(), "Blog");
        assert_eq!(blog.get("name").and_then(Value::as_str), Some("Alice"));
        assert!(blog.get_value("rating").is_none());
        assert_eq!(blog.remove("id"), Some(Value::BigInt(1)));
        assert!(blog.get_value("id").is_none());
    }

    #[test]
    fn test_collection_add_is_idempotent() {
        let blog = DynamicEntity::new("Blog").shared();
        let post = entity_ref(&DynamicEntity::new("Post").shared());

        blog.borrow_mut().add_to_collection("posts", post.clone());
        blog.borrow_mut().add_to_collection("posts", post.clone());
        assert_eq!(blog.borrow().items("posts").len(), 1);

        assert!(blog.borrow_mut().remove_from_collection("posts", &post));
        assert!(!blog.borrow_mut().remove_from_collection("posts", &post));
    }

    #[test]
    fn test_reference_roundtrip() {
        let blog = entity_ref(&DynamicEntity::new("Blog").shared());
        let mut post = DynamicEntity::new("Post");
        post.set_reference("blog", Some(blog.clone()));
        assert!(post.reference("blog").is_some_and(|b| Rc::ptr_eq(&b, &blog)));
        post.set_reference("blog", None);
        assert!(post.reference("blog").is_none());
    }
}
