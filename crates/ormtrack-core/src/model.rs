//! Read-only model metadata.
//!
//! A [`Model`] is assembled once with [`ModelBuilder`] and then shared
//! (behind an `Arc`) by every session that tracks entities of its types.
//! Entity types, properties and foreign keys are addressed by index after
//! building so hot paths in the tracker never hash names.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::property::Property;
use crate::relationship::{ForeignKey, Navigation};

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    name: String,
    properties: Vec<Property>,
    key: Vec<usize>,
    navigations: Vec<Navigation>,
    foreign_keys: Vec<usize>,
    referencing_keys: Vec<usize>,
}

impl EntityType {
    /// Create an entity type with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            key: Vec::new(),
            navigations: Vec::new(),
            foreign_keys: Vec::new(),
            referencing_keys: Vec::new(),
        }
    }

    /// Add a property. Key members form the primary key in declaration order.
    pub fn property(mut self, property: Property) -> Self {
        if property.key {
            self.key.push(self.properties.len());
        }
        self.properties.push(property);
        self
    }

    /// Entity type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All scalar properties in declaration order.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Property by index.
    pub fn property_at(&self, index: usize) -> &Property {
        &self.properties[index]
    }

    /// Index of the named property.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Named property.
    pub fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Indices of the primary key properties.
    pub fn key_indices(&self) -> &[usize] {
        &self.key
    }

    /// Whether the entity type declares a primary key.
    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Navigations declared on this type.
    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    /// Named navigation.
    pub fn find_navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Foreign keys where this type is the dependent.
    pub fn foreign_keys(&self) -> &[usize] {
        &self.foreign_keys
    }

    /// Foreign keys where this type is the principal.
    pub fn referencing_foreign_keys(&self) -> &[usize] {
        &self.referencing_keys
    }
}

/// Immutable model: the set of entity types and their relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    entity_types: Vec<EntityType>,
    foreign_keys: Vec<ForeignKey>,
    by_name: HashMap<String, usize>,
}

impl Model {
    /// Start building a model.
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// All entity types.
    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    /// Entity type by index.
    pub fn entity_type_at(&self, index: usize) -> &EntityType {
        &self.entity_types[index]
    }

    /// Index of the named entity type.
    pub fn entity_type_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Named entity type.
    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_type_index(name).map(|i| &self.entity_types[i])
    }

    /// Named entity type, or `UnknownEntityType`.
    pub fn entity_type(&self, name: &str) -> Result<&EntityType> {
        self.find_entity_type(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    /// All foreign keys.
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Foreign key by index.
    pub fn foreign_key_at(&self, index: usize) -> &ForeignKey {
        &self.foreign_keys[index]
    }
}

/// Assembles and validates a [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    entity_types: Vec<EntityType>,
    foreign_keys: Vec<ForeignKey>,
}

impl ModelBuilder {
    /// Add an entity type.
    pub fn entity(mut self, entity_type: EntityType) -> Self {
        self.entity_types.push(entity_type);
        self
    }

    /// Add a relationship.
    pub fn relationship(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Resolve names to indices, derive navigations and validate.
    pub fn build(self) -> Result<Model> {
        let mut entity_types = self.entity_types;
        let mut foreign_keys = self.foreign_keys;

        let mut by_name = HashMap::new();
        for (idx, et) in entity_types.iter().enumerate() {
            if by_name.insert(et.name.clone(), idx).is_some() {
                return Err(Error::InvalidModel(format!(
                    "entity type '{}' declared twice",
                    et.name
                )));
            }
            let mut seen = std::collections::HashSet::new();
            for p in &et.properties {
                if !seen.insert(p.name.as_str()) {
                    return Err(Error::InvalidModel(format!(
                        "property '{}.{}' declared twice",
                        et.name, p.name
                    )));
                }
            }
        }

        for (fk_idx, fk) in foreign_keys.iter_mut().enumerate() {
            let dependent = *by_name.get(&fk.dependent).ok_or_else(|| {
                Error::InvalidModel(format!(
                    "foreign key references unknown dependent '{}'",
                    fk.dependent
                ))
            })?;
            let principal = *by_name.get(&fk.principal).ok_or_else(|| {
                Error::InvalidModel(format!(
                    "foreign key references unknown principal '{}'",
                    fk.principal
                ))
            })?;

            let principal_key = entity_types[principal].key.clone();
            if principal_key.is_empty() {
                return Err(Error::InvalidModel(format!(
                    "principal '{}' has no primary key",
                    fk.principal
                )));
            }
            if principal_key.len() != fk.properties.len() {
                return Err(Error::InvalidModel(format!(
                    "foreign key {}({}) does not match the key arity of '{}'",
                    fk.dependent,
                    fk.properties.join(", "),
                    fk.principal
                )));
            }

            let mut indices = Vec::with_capacity(fk.properties.len());
            for name in &fk.properties {
                let idx = entity_types[dependent].property_index(name).ok_or_else(|| {
                    Error::InvalidModel(format!(
                        "foreign key property '{}.{}' does not exist",
                        fk.dependent, name
                    ))
                })?;
                indices.push(idx);
            }

            fk.property_indices = indices;
            fk.principal_key_indices = principal_key;
            fk.dependent_index = dependent;
            fk.principal_index = principal;

            if let Some(name) = &fk.dependent_navigation {
                add_navigation(
                    &mut entity_types[dependent],
                    Navigation {
                        name: name.clone(),
                        declaring_type: dependent,
                        target_type: principal,
                        is_collection: false,
                        on_dependent: true,
                        foreign_key: fk_idx,
                        inverse: fk.principal_navigation.clone(),
                    },
                )?;
            }
            if let Some(name) = &fk.principal_navigation {
                add_navigation(
                    &mut entity_types[principal],
                    Navigation {
                        name: name.clone(),
                        declaring_type: principal,
                        target_type: dependent,
                        is_collection: !fk.unique,
                        on_dependent: false,
                        foreign_key: fk_idx,
                        inverse: fk.dependent_navigation.clone(),
                    },
                )?;
            }

            entity_types[dependent].foreign_keys.push(fk_idx);
            entity_types[principal].referencing_keys.push(fk_idx);
        }

        tracing::debug!(
            entity_types = entity_types.len(),
            foreign_keys = foreign_keys.len(),
            "Model built"
        );

        Ok(Model {
            entity_types,
            foreign_keys,
            by_name,
        })
    }
}

fn add_navigation(entity_type: &mut EntityType, navigation: Navigation) -> Result<()> {
    if entity_type.find_navigation(&navigation.name).is_some()
        || entity_type.property_index(&navigation.name).is_some()
    {
        return Err(Error::InvalidModel(format!(
            "member '{}.{}' declared twice",
            entity_type.name, navigation.name
        )));
    }
    entity_type.navigations.push(navigation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{ValueGenerated, ValueKind};

    fn blog_model() -> Result<Model> {
        Model::builder()
            .entity(
                EntityType::new("Blog")
                    .property(
                        Property::new("id", ValueKind::BigInt)
                            .key()
                            .generated(ValueGenerated::OnAdd),
                    )
                    .property(Property::new("name", ValueKind::Text)),
            )
            .entity(
                EntityType::new("Post")
                    .property(Property::new("id", ValueKind::BigInt).key())
                    .property(Property::new("blog_id", ValueKind::BigInt).nullable()),
            )
            .relationship(
                ForeignKey::new("Post", ["blog_id"], "Blog")
                    .dependent_navigation("blog")
                    .principal_navigation("posts"),
            )
            .build()
    }

    #[test]
    fn test_build_derives_navigations() {
        let model = blog_model().unwrap();
        let blog = model.entity_type("Blog").unwrap();
        let posts = blog.find_navigation("posts").unwrap();
        assert!(posts.is_collection);
        assert!(!posts.on_dependent);
        assert_eq!(posts.inverse.as_deref(), Some("blog"));

        let post = model.entity_type("Post").unwrap();
        let nav = post.find_navigation("blog").unwrap();
        assert!(nav.on_dependent && !nav.is_collection);
        assert_eq!(post.foreign_keys(), &[0]);
        assert_eq!(blog.referencing_foreign_keys(), &[0]);
        assert_eq!(model.foreign_key_at(0).property_indices(), &[1]);
    }

    #[test]
    fn test_key_indices_follow_declaration_order() {
        let model = blog_model().unwrap();
        assert_eq!(model.entity_type("Blog").unwrap().key_indices(), &[0]);
    }

    #[test]
    fn test_unknown_entity_type() {
        let model = blog_model().unwrap();
        assert_eq!(
            model.entity_type("Tag").unwrap_err(),
            Error::UnknownEntityType("Tag".into())
        );
    }

    #[test]
    fn test_rejects_arity_mismatch() {
        let err = Model::builder()
            .entity(EntityType::new("A").property(Property::new("id", ValueKind::Int).key()))
            .entity(
                EntityType::new("B")
                    .property(Property::new("id", ValueKind::Int).key())
                    .property(Property::new("a1", ValueKind::Int))
                    .property(Property::new("a2", ValueKind::Int)),
            )
            .relationship(ForeignKey::new("B", ["a1", "a2"], "A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)));
    }

    #[test]
    fn test_rejects_navigation_clashing_with_property() {
        let err = Model::builder()
            .entity(EntityType::new("A").property(Property::new("id", ValueKind::Int).key()))
            .entity(
                EntityType::new("B")
                    .property(Property::new("id", ValueKind::Int).key())
                    .property(Property::new("a", ValueKind::Int)),
            )
            .relationship(ForeignKey::new("B", ["a"], "A").dependent_navigation("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)));
    }
}
