//! ormtrack: change tracking and unit of work for object-relational mapping.
//!
//! This facade re-exports the workspace so applications depend on one crate:
//!
//! - [`ormtrack_core`]: values, errors, model metadata and the [`Entity`]
//!   capability trait.
//! - [`ormtrack_session`]: the [`Session`] (identity map, change detection,
//!   relationship fixup, graph attach and save coordination) and the
//!   [`PersistenceGateway`] contract with its in-memory implementation.
//!
//! # Example
//!
//! ```ignore
//! use ormtrack::prelude::*;
//!
//! let model = Arc::new(
//!     Model::builder()
//!         .entity(
//!             EntityType::new("Blog")
//!                 .property(Property::new("id", ValueKind::BigInt).key().generated(ValueGenerated::OnAdd))
//!                 .property(Property::new("name", ValueKind::Text)),
//!         )
//!         .build()?,
//! );
//! let session = Session::new(MemoryGateway::new(model.clone()), model);
//!
//! let blog = DynamicEntity::new("Blog").with("name", "News").into_ref();
//! session.add(&blog)?;
//! session.save_changes()?;
//! assert_eq!(session.state_of(&blog), EntityState::Unchanged);
//! ```

pub use ormtrack_core as core;
pub use ormtrack_session as session;

pub use ormtrack_core::{
    Cx, DeleteBehavior, DynamicEntity, Entity, EntityId, EntityRef, EntityType, Error, FieldsSet,
    ForeignKey, Model, ModelBuilder, Navigation, Outcome, Property, Result, StorageError, Value,
    ValueGenerated, ValueKind, entity_ref,
};
pub use ormtrack_session::{
    EntityKey, EntityState, EntryId, EntryView, KeyPropagation, MemoryGateway, PersistenceGateway,
    Row, Session, SessionConfig, SessionDebugInfo, StateChangedEvent, TrackedEvent, WriteBatch,
    WriteCommand, WriteKind, WriteResult,
};

/// Everything needed to define a model, track entities and save them.
pub mod prelude {
    pub use std::sync::Arc;

    pub use ormtrack_core::{
        Cx, DeleteBehavior, DynamicEntity, Entity, EntityRef, EntityType, Error, ForeignKey, Model,
        Outcome, Property, Result, Value, ValueGenerated, ValueKind,
    };
    pub use ormtrack_session::{
        EntityState, EntryView, MemoryGateway, PersistenceGateway, Session, SessionConfig,
        WriteBatch, WriteResult,
    };
}
