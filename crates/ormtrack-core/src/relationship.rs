//! Relationship metadata.
//!
//! A relationship is declared once as a [`ForeignKey`] on the dependent type.
//! [`ModelBuilder::build`](crate::ModelBuilder::build) derives the
//! [`Navigation`]s on both ends from it, so the change tracker can walk from a
//! navigation to its foreign key and inverse without any lookups by name.

/// What happens to tracked dependents when their principal is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Tracked dependents are deleted too.
    Cascade,
    /// Tracked dependents have their foreign key set to NULL.
    #[default]
    ClientSetNull,
    /// Tracked dependents are left alone; the store enforces the constraint.
    Restrict,
}

/// A foreign key from a dependent entity type to a principal's primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    /// Dependent entity type name.
    pub dependent: String,
    /// Foreign key property names on the dependent, in principal key order.
    pub properties: Vec<String>,
    /// Principal entity type name.
    pub principal: String,
    /// Reference navigation on the dependent pointing at the principal.
    pub dependent_navigation: Option<String>,
    /// Navigation on the principal pointing back at its dependent(s).
    pub principal_navigation: Option<String>,
    /// One-to-one: the principal navigation is a reference, not a collection.
    pub unique: bool,
    /// A dependent cannot exist without its principal.
    pub required: bool,
    /// Delete behavior for tracked dependents.
    pub delete_behavior: DeleteBehavior,
    pub(crate) property_indices: Vec<usize>,
    pub(crate) principal_key_indices: Vec<usize>,
    pub(crate) dependent_index: usize,
    pub(crate) principal_index: usize,
}

impl ForeignKey {
    /// Declare a foreign key from `dependent.properties` to `principal`'s key.
    pub fn new<I, S>(dependent: impl Into<String>, properties: I, principal: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependent: dependent.into(),
            properties: properties.into_iter().map(Into::into).collect(),
            principal: principal.into(),
            dependent_navigation: None,
            principal_navigation: None,
            unique: false,
            required: false,
            delete_behavior: DeleteBehavior::default(),
            property_indices: Vec::new(),
            principal_key_indices: Vec::new(),
            dependent_index: 0,
            principal_index: 0,
        }
    }

    /// Set the reference navigation on the dependent.
    pub fn dependent_navigation(mut self, name: impl Into<String>) -> Self {
        self.dependent_navigation = Some(name.into());
        self
    }

    /// Set the navigation on the principal.
    pub fn principal_navigation(mut self, name: impl Into<String>) -> Self {
        self.principal_navigation = Some(name.into());
        self
    }

    /// Make the relationship one-to-one.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Make the relationship required. Required relationships cascade by default.
    pub fn required(mut self) -> Self {
        self.required = true;
        if self.delete_behavior == DeleteBehavior::ClientSetNull {
            self.delete_behavior = DeleteBehavior::Cascade;
        }
        self
    }

    /// Override the delete behavior.
    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = behavior;
        self
    }

    /// Indices of the foreign key properties on the dependent type.
    pub fn property_indices(&self) -> &[usize] {
        &self.property_indices
    }

    /// Indices of the principal key properties on the principal type.
    pub fn principal_key_indices(&self) -> &[usize] {
        &self.principal_key_indices
    }

    /// Index of the dependent entity type in the model.
    pub fn dependent_index(&self) -> usize {
        self.dependent_index
    }

    /// Index of the principal entity type in the model.
    pub fn principal_index(&self) -> usize {
        self.principal_index
    }

    /// Whether the dependent and principal are the same type.
    pub fn is_self_referencing(&self) -> bool {
        self.dependent_index == self.principal_index
    }
}

/// A navigation derived from a foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Navigation name on the declaring type.
    pub name: String,
    /// Declaring entity type index.
    pub declaring_type: usize,
    /// Target entity type index.
    pub target_type: usize,
    /// Collection (one-to-many principal side) or reference.
    pub is_collection: bool,
    /// Whether the declaring type is the dependent end of the foreign key.
    pub on_dependent: bool,
    /// Index of the foreign key in the model.
    pub foreign_key: usize,
    /// Name of the navigation at the other end, if declared.
    pub inverse: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_builder_chain() {
        let fk = ForeignKey::new("Post", ["blog_id"], "Blog")
            .dependent_navigation("blog")
            .principal_navigation("posts")
            .required();

        assert_eq!(fk.dependent, "Post");
        assert_eq!(fk.properties, vec!["blog_id".to_string()]);
        assert_eq!(fk.principal, "Blog");
        assert_eq!(fk.dependent_navigation.as_deref(), Some("blog"));
        assert_eq!(fk.principal_navigation.as_deref(), Some("posts"));
        assert!(fk.required);
        assert!(!fk.unique);
        assert_eq!(fk.delete_behavior, DeleteBehavior::Cascade);
    }

    #[test]
    fn test_required_keeps_explicit_behavior() {
        let fk = ForeignKey::new("Post", ["blog_id"], "Blog")
            .on_delete(DeleteBehavior::Restrict)
            .required();
        assert_eq!(fk.delete_behavior, DeleteBehavior::Restrict);
    }
}
