//! Core types and traits for ormtrack.
//!
//! `ormtrack-core` is the **foundation layer** for the workspace. It defines the
//! contracts and data types the change tracker builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: [`Entity`] is the capability interface through which the
//!   tracker reads and writes properties and navigations of opaque entity objects.
//! - **Metadata**: [`Model`], [`EntityType`], [`Property`], [`ForeignKey`] and
//!   [`Navigation`] describe entity shape. They are read-only once built.
//! - **Data model**: [`Value`] carries property values between entities,
//!   snapshots and the persistence gateway.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync so
//!   asynchronous saves are cancel-correct.
//!
//! # Who Uses This Crate
//!
//! - `ormtrack-session` builds identity resolution, change detection, fixup and
//!   the save pipeline on top of these types.
//! - Gateway implementations consume [`Value`] and [`Error`].
//!
//! Most applications should use the `ormtrack` facade.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod dynamic;
pub mod entity;
pub mod error;
pub mod fields_set;
pub mod model;
pub mod property;
pub mod relationship;
pub mod value;

pub use dynamic::DynamicEntity;
pub use entity::{Entity, EntityId, EntityRef, contains_entity, entity_ref};
pub use error::{Error, Result, StorageError};
pub use fields_set::FieldsSet;
pub use model::{EntityType, Model, ModelBuilder};
pub use property::{Property, ValueGenerated, ValueKind};
pub use relationship::{DeleteBehavior, ForeignKey, Navigation};
pub use value::{Value, hash_values};
