//! Property metadata.

use crate::value::Value;

/// When the store produces a value for a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueGenerated {
    /// The application always supplies the value.
    #[default]
    Never,
    /// The store generates a value on insert when the entity holds a default.
    OnAdd,
    /// The store generates a value on every insert and update (row versions).
    OnAddOrUpdate,
}

/// Declared value type of a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueKind {
    /// Boolean.
    Bool,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// 64-bit float.
    Double,
    /// Decimal as text.
    Decimal,
    /// Text.
    #[default]
    Text,
    /// Bytes.
    Bytes,
    /// Date.
    Date,
    /// Time of day.
    Time,
    /// Timestamp.
    Timestamp,
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
}

impl ValueKind {
    /// The zero value of this kind.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::BigInt => Value::BigInt(0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Decimal => Value::Decimal("0".to_string()),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Bytes => Value::Bytes(Vec::new()),
            ValueKind::Date => Value::Date(0),
            ValueKind::Time => Value::Time(0),
            ValueKind::Timestamp => Value::Timestamp(0),
            ValueKind::Uuid => Value::Uuid([0; 16]),
            ValueKind::Json => Value::Json(serde_json::Value::Null),
        }
    }
}

/// Metadata about one scalar property of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name, unique within its entity type.
    pub name: String,
    /// Declared value type.
    pub kind: ValueKind,
    /// Whether NULL is an acceptable value.
    pub nullable: bool,
    /// Whether the property is part of the primary key.
    pub key: bool,
    /// Whether the property is checked against the store on update/delete.
    pub concurrency_token: bool,
    /// Store value generation policy.
    pub value_generated: ValueGenerated,
    /// Whether the value lives in the tracker instead of on the entity.
    pub shadow: bool,
}

impl Property {
    /// Create a non-nullable, non-key property.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            key: false,
            concurrency_token: false,
            value_generated: ValueGenerated::Never,
            shadow: false,
        }
    }

    /// Mark as primary key member.
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Mark as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark as concurrency token.
    pub fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }

    /// Set the value generation policy.
    pub fn generated(mut self, policy: ValueGenerated) -> Self {
        self.value_generated = policy;
        self
    }

    /// Store the value in the tracker rather than on the entity.
    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    /// Value a fresh shadow slot starts with.
    pub fn initial_value(&self) -> Value {
        if self.nullable {
            Value::Null
        } else {
            self.kind.zero()
        }
    }

    /// Whether the store produces a value on insert.
    pub const fn generated_on_add(&self) -> bool {
        matches!(
            self.value_generated,
            ValueGenerated::OnAdd | ValueGenerated::OnAddOrUpdate
        )
    }

    /// Whether the store produces a value on update.
    pub const fn generated_on_update(&self) -> bool {
        matches!(self.value_generated, ValueGenerated::OnAddOrUpdate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_builder_chain() {
        let p = Property::new("id", ValueKind::BigInt)
            .key()
            .generated(ValueGenerated::OnAdd);
        assert!(p.key);
        assert!(!p.nullable);
        assert!(p.generated_on_add());
        assert!(!p.generated_on_update());
    }

    #[test]
    fn test_initial_value_respects_nullability() {
        assert_eq!(
            Property::new("n", ValueKind::Int).initial_value(),
            Value::Int(0)
        );
        assert_eq!(
            Property::new("n", ValueKind::Int).nullable().initial_value(),
            Value::Null
        );
    }
}
