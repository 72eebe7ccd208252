//! Change tracking session and unit of work for ormtrack.
//!
//! The [`Session`] is the central unit-of-work manager. It tracks entity
//! instances, records how they differ from the last known database state, keeps
//! both ends of every relationship consistent, and turns pending changes into an
//! ordered batch of writes for a [`PersistenceGateway`].
//!
//! # Design Philosophy
//!
//! - **Explicit state**: every tracked instance has exactly one
//!   [`EntityState`]; transitions happen only inside session operations
//! - **Identity resolution**: at most one tracked instance per entity type and
//!   fully-assigned key
//! - **Snapshot diffing**: changes are found by comparing current values with
//!   originals, so entities stay plain objects
//! - **All-or-nothing saves**: a failed save leaves every entry as it was
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(MemoryGateway::new(model.clone()), model);
//!
//! // Track a new graph (will be INSERTed on save)
//! session.add(&blog)?;
//!
//! // Mutate tracked entities directly
//! blog.borrow_mut().set_value("name", Value::from("Renamed"));
//!
//! // Detect changes and write them
//! let written = session.save_changes()?;
//! ```

use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use asupersync::{Cx, Outcome};
use ormtrack_core::{EntityRef, Error, Model, Result, Value};

mod change_detector;
mod concurrency;
pub mod entry;
pub mod events;
pub mod gateway;
mod graph_attacher;
pub mod identity_map;
pub mod memory;
mod navigation_fixer;
mod save;
pub mod state;
mod state_manager;

pub use entry::{EntryId, EntryView};
pub use events::{StateChangedEvent, TrackedEvent};
pub use gateway::{KeyPropagation, PersistenceGateway, WriteBatch, WriteCommand, WriteKind, WriteResult};
pub use identity_map::EntityKey;
pub use memory::{MemoryGateway, Row};
pub use state::EntityState;

use concurrency::ConcurrencyDetector;
use events::TrackingEvent;
use navigation_fixer::NavigationFixer;
use state_manager::StateManager;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Run change detection before saving and before `has_changes`/`entries`.
    pub auto_detect_changes: bool,
    /// Accept written entries (originals refreshed, Deleted evicted) after a
    /// successful save.
    pub accept_all_changes_on_success: bool,
    /// Apply delete behaviors to tracked dependents of a deleted principal.
    pub cascade_delete: bool,
    /// Delete dependents severed from a required relationship.
    pub delete_orphans: bool,
    /// Include key values in errors and logs.
    pub sensitive_logging: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            accept_all_changes_on_success: true,
            cascade_delete: true,
            delete_orphans: true,
            sensitive_logging: false,
        }
    }
}

impl SessionConfig {
    /// Set `auto_detect_changes`.
    pub fn auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    /// Set `accept_all_changes_on_success`.
    pub fn accept_all_changes_on_success(mut self, enabled: bool) -> Self {
        self.accept_all_changes_on_success = enabled;
        self
    }

    /// Set `cascade_delete`.
    pub fn cascade_delete(mut self, enabled: bool) -> Self {
        self.cascade_delete = enabled;
        self
    }

    /// Set `delete_orphans`.
    pub fn delete_orphans(mut self, enabled: bool) -> Self {
        self.delete_orphans = enabled;
        self
    }

    /// Set `sensitive_logging`.
    pub fn sensitive_logging(mut self, enabled: bool) -> Self {
        self.sensitive_logging = enabled;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

type TrackedListener<G> = Rc<dyn Fn(&Session<G>, &TrackedEvent)>;
type StateChangedListener<G> = Rc<dyn Fn(&Session<G>, &StateChangedEvent)>;

/// The Session is the central unit-of-work manager.
///
/// A session has a single logical owner. Every operation takes `&self`;
/// overlapping use (a listener or entity accessor calling back into a mutating
/// operation, or a second asynchronous save while one is suspended) fails with
/// [`Error::ConcurrentAccess`] instead of blocking.
pub struct Session<G: PersistenceGateway> {
    /// The persistence gateway.
    gateway: G,
    /// Entity metadata.
    model: Arc<Model>,
    /// Configuration.
    config: SessionConfig,
    /// Runtime override of `config.auto_detect_changes`.
    auto_detect: Cell<bool>,
    /// Entries, identity map and queued events.
    state: RefCell<StateManager>,
    /// Entry/exit counter around mutating operations.
    detector: ConcurrencyDetector,
    tracked_listeners: RefCell<Vec<TrackedListener<G>>>,
    state_listeners: RefCell<Vec<StateChangedListener<G>>>,
}

impl<G: PersistenceGateway> Session<G> {
    /// Create a new session with default configuration.
    pub fn new(gateway: G, model: Arc<Model>) -> Self {
        Self::with_config(gateway, model, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(gateway: G, model: Arc<Model>, config: SessionConfig) -> Self {
        Self {
            gateway,
            auto_detect: Cell::new(config.auto_detect_changes),
            state: RefCell::new(StateManager::new(Arc::clone(&model), config.clone())),
            model,
            config,
            detector: ConcurrencyDetector::default(),
            tracked_listeners: RefCell::new(Vec::new()),
            state_listeners: RefCell::new(Vec::new()),
        }
    }

    /// Get a reference to the persistence gateway.
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get the model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Whether change detection runs automatically.
    pub fn auto_detect_changes(&self) -> bool {
        self.auto_detect.get()
    }

    /// Toggle automatic change detection on this session.
    pub fn set_auto_detect_changes(&self, enabled: bool) {
        self.auto_detect.set(enabled);
    }

    // ========================================================================
    // Operation plumbing
    // ========================================================================

    fn borrow_state(&self, operation: &'static str) -> Result<RefMut<'_, StateManager>> {
        self.state
            .try_borrow_mut()
            .map_err(|_| Error::ConcurrentAccess { operation })
    }

    /// Run a mutating operation: claim the session, mutate, then dispatch the
    /// events it produced while the session is still claimed.
    fn mutate<T>(&self, operation: &'static str, f: impl FnOnce(&mut StateManager) -> Result<T>) -> Result<T> {
        let _guard = self.detector.enter(operation)?;
        let result = {
            let mut state = self.borrow_state(operation)?;
            f(&mut state)
        };
        self.dispatch_events();
        result
    }

    fn read<T: Default>(&self, f: impl FnOnce(&StateManager) -> T) -> T {
        self.state.try_borrow().map(|s| f(&s)).unwrap_or_default()
    }

    fn dispatch_events(&self) {
        let events = match self.state.try_borrow_mut() {
            Ok(mut state) => state.take_events(),
            Err(_) => return,
        };
        if events.is_empty() {
            return;
        }
        let tracked: Vec<_> = self.tracked_listeners.borrow().clone();
        let changed: Vec<_> = self.state_listeners.borrow().clone();
        for event in &events {
            match event {
                TrackingEvent::Tracked(e) => tracked.iter().for_each(|l| l(self, e)),
                TrackingEvent::StateChanged(e) => changed.iter().for_each(|l| l(self, e)),
            }
        }
    }

    fn run_detection(&self, state: &mut StateManager) -> Result<()> {
        let _detecting = self.detector.detecting();
        change_detector::detect_changes(state)
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Track `entity` and every untracked entity reachable from it as Added.
    ///
    /// Adding a tracked Deleted entity undeletes it.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn add(&self, entity: &EntityRef) -> Result<()> {
        self.mutate("add", |sm| add_one(sm, entity))
    }

    /// [`add`](Self::add) for several roots.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn add_range(&self, entities: &[EntityRef]) -> Result<()> {
        self.mutate("add", |sm| entities.iter().try_for_each(|e| add_one(sm, e)))
    }

    /// Track `entity` as Unchanged. Reachable untracked entities are Unchanged
    /// when their key is assigned and Added otherwise.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn attach(&self, entity: &EntityRef) -> Result<()> {
        self.mutate("attach", |sm| {
            graph_attacher::attach_graph(sm, entity, EntityState::Unchanged).map(drop)
        })
    }

    /// [`attach`](Self::attach) for several roots.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn attach_range(&self, entities: &[EntityRef]) -> Result<()> {
        self.mutate("attach", |sm| {
            entities.iter().try_for_each(|e| {
                graph_attacher::attach_graph(sm, e, EntityState::Unchanged).map(drop)
            })
        })
    }

    /// Track `entity` as Modified with every non-key property flagged.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn update(&self, entity: &EntityRef) -> Result<()> {
        self.mutate("update", |sm| {
            graph_attacher::attach_graph(sm, entity, EntityState::Modified).map(drop)
        })
    }

    /// [`update`](Self::update) for several roots.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn update_range(&self, entities: &[EntityRef]) -> Result<()> {
        self.mutate("update", |sm| {
            entities.iter().try_for_each(|e| {
                graph_attacher::attach_graph(sm, e, EntityState::Modified).map(drop)
            })
        })
    }

    /// Mark `entity` Deleted. An Added entity is detached instead.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.mutate("remove", |sm| remove_one(sm, entity))
    }

    /// [`remove`](Self::remove) for several entities.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn remove_range(&self, entities: &[EntityRef]) -> Result<()> {
        self.mutate("remove", |sm| entities.iter().try_for_each(|e| remove_one(sm, e)))
    }

    /// Track an entity materialized by a query.
    ///
    /// If an entry with the same identity exists, its instance is returned and
    /// `entity` is discarded. Otherwise `entity` is tracked as Unchanged and
    /// returned.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn track_from_query(&self, entity: EntityRef) -> Result<EntityRef> {
        self.mutate("track_from_query", |sm| {
            if sm.entry_id_of(&entity).is_some() {
                return Ok(entity);
            }
            let type_index = sm.resolve_type(&entity)?;
            let model = Arc::clone(sm.model());
            let key = graph_attacher::read_key(&entity, model.entity_type_at(type_index));
            if let Some(existing) = EntityKey::assigned(type_index, key)
                .and_then(|k| sm.find_by_key(&k))
                .and_then(|id| sm.entity(id))
            {
                tracing::debug!(
                    entity_type = model.entity_type_at(type_index).name(),
                    "Identity resolved to tracked instance"
                );
                return Ok(existing);
            }
            graph_attacher::attach_single(sm, &entity, EntityState::Unchanged, true)?;
            Ok(entity)
        })
    }

    /// Tracked instance with this key. Consults the identity map only.
    pub fn find(&self, entity_type: &str, key: &[Value]) -> Result<Option<EntityRef>> {
        let id = self.find_entry_id(entity_type, key)?;
        Ok(id.and_then(|id| self.read(|sm| sm.entity(id))))
    }

    /// Entry holding this key.
    pub fn find_entry_id(&self, entity_type: &str, key: &[Value]) -> Result<Option<EntryId>> {
        let state = self
            .state
            .try_borrow()
            .map_err(|_| Error::ConcurrentAccess { operation: "find" })?;
        let type_index = state
            .model()
            .entity_type_index(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))?;
        Ok(EntityKey::assigned(type_index, key.to_vec()).and_then(|k| state.find_by_key(&k)))
    }

    /// Entry of a tracked instance.
    pub fn entry_id(&self, entity: &EntityRef) -> Option<EntryId> {
        self.read(|sm| sm.entry_id_of(entity))
    }

    /// Snapshot of the entry of a tracked instance.
    pub fn entry(&self, entity: &EntityRef) -> Option<EntryView> {
        self.read(|sm| sm.entry_id_of(entity).and_then(|id| sm.view(id)))
    }

    /// Whether `entity` is tracked.
    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        self.entry_id(entity).is_some()
    }

    /// State of `entity`; `Detached` when untracked.
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.read(|sm| sm.entry_id_of(entity).map(|id| sm.state(id)).unwrap_or_default())
    }

    /// Force the state of `entity`. Untracked entities are tracked alone,
    /// without walking their graph.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn set_state(&self, entity: &EntityRef, state: EntityState) -> Result<()> {
        self.mutate("set_state", |sm| {
            let Some(id) = sm.entry_id_of(entity) else {
                if state == EntityState::Detached {
                    return Ok(());
                }
                return graph_attacher::attach_single(sm, entity, state, false).map(drop);
            };
            match state {
                EntityState::Deleted => NavigationFixer::new(sm).delete(id),
                EntityState::Detached => {
                    sm.stop_tracking(id);
                    Ok(())
                }
                EntityState::Added | EntityState::Unchanged | EntityState::Modified => {
                    sm.change_state(id, state);
                    Ok(())
                }
            }
        })
    }

    // ========================================================================
    // Property access
    // ========================================================================

    /// Current value of a property, including shadow properties.
    pub fn current_value(&self, entity: &EntityRef, property: &str) -> Result<Value> {
        let state = self
            .state
            .try_borrow()
            .map_err(|_| Error::ConcurrentAccess { operation: "current_value" })?;
        let (id, idx) = locate(&state, entity, property)?;
        state
            .value(id, idx)
            .ok_or_else(|| not_tracked(entity))
    }

    /// Write the current value of a property, including shadow properties.
    ///
    /// Key properties of entities that exist in the database cannot change.
    #[tracing::instrument(level = "debug", skip(self, entity, value))]
    pub fn set_current_value(&self, entity: &EntityRef, property: &str, value: Value) -> Result<()> {
        self.mutate("set_current_value", |sm| {
            let (id, idx) = locate(sm, entity, property)?;
            let model = Arc::clone(sm.model());
            let et = model.entity_type_at(sm.type_index(id).unwrap_or_default());
            let is_key = et.property_at(idx).key;
            if is_key && sm.state(id).is_persisted() && !sm.value(id, idx).is_some_and(|v| v.same_as(&value)) {
                return Err(Error::KeyModified {
                    entity_type: et.name().to_string(),
                    property: property.to_string(),
                });
            }
            sm.write_values(id, &[idx], &[value]);
            if is_key {
                sm.rekey(id)?;
            }
            Ok(())
        })
    }

    /// Original value of a property; `None` while the entity is Added.
    pub fn original_value(&self, entity: &EntityRef, property: &str) -> Result<Option<Value>> {
        let state = self
            .state
            .try_borrow()
            .map_err(|_| Error::ConcurrentAccess { operation: "original_value" })?;
        let (id, idx) = locate(&state, entity, property)?;
        Ok(state.entry(id).and_then(|e| e.original_value(idx).cloned()))
    }

    /// Whether a property is flagged modified.
    pub fn is_property_modified(&self, entity: &EntityRef, property: &str) -> Result<bool> {
        let state = self
            .state
            .try_borrow()
            .map_err(|_| Error::ConcurrentAccess { operation: "is_property_modified" })?;
        let (id, idx) = locate(&state, entity, property)?;
        Ok(state.entry(id).is_some_and(|e| e.is_property_modified(idx)))
    }

    /// Flag or unflag a property. Unflagging restores the original value.
    ///
    /// Only Unchanged and Modified entries carry flags; key properties are
    /// never flagged.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn set_property_modified(&self, entity: &EntityRef, property: &str, modified: bool) -> Result<()> {
        self.mutate("set_property_modified", |sm| {
            let (id, idx) = locate(sm, entity, property)?;
            let model = Arc::clone(sm.model());
            let et = model.entity_type_at(sm.type_index(id).unwrap_or_default());
            if et.property_at(idx).key {
                return Err(Error::InvalidOperation(format!(
                    "key property '{}.{}' cannot be flagged modified",
                    et.name(),
                    property
                )));
            }
            if !matches!(sm.state(id), EntityState::Unchanged | EntityState::Modified) {
                return Err(Error::InvalidOperation(format!(
                    "cannot flag properties of a {} entity",
                    sm.state(id)
                )));
            }
            if modified {
                if let Some(entry) = sm.entry_mut(id) {
                    entry.explicit_modified.set(idx);
                }
            } else {
                let original = sm.entry(id).and_then(|e| e.original_value(idx).cloned());
                if let Some(original) = original {
                    sm.write_values(id, &[idx], &[original]);
                }
                if let Some(entry) = sm.entry_mut(id) {
                    entry.explicit_modified.unset(idx);
                    entry.detected_modified.unset(idx);
                }
            }
            sm.refresh_from_flags(id);
            Ok(())
        })
    }

    // ========================================================================
    // Change detection
    // ========================================================================

    /// Compare every tracked entity with its snapshot and fix up relationships.
    ///
    /// Calling this from inside a detection pass (for example from a
    /// state-changed listener) fails with [`Error::RecursiveDetection`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&self) -> Result<()> {
        let _guard = self.detector.enter("detect_changes")?;
        let _detecting = self.detector.detecting();
        let result = {
            let mut state = self.borrow_state("detect_changes")?;
            change_detector::detect_changes(&mut state)
        };
        self.dispatch_events();
        result
    }

    /// Whether saving would write anything.
    pub fn has_changes(&self) -> Result<bool> {
        self.mutate("has_changes", |sm| {
            if self.auto_detect.get() {
                self.run_detection(sm)?;
            }
            Ok(sm.has_pending_writes())
        })
    }

    /// Snapshots of every tracked entry, in tracking order.
    pub fn entries(&self) -> Result<Vec<EntryView>> {
        self.mutate("entries", |sm| {
            if self.auto_detect.get() {
                self.run_detection(sm)?;
            }
            Ok(sm.ids().into_iter().filter_map(|id| sm.view(id)).collect())
        })
    }

    // ========================================================================
    // Saving
    // ========================================================================

    fn prepare_save(&self, operation: &'static str) -> Result<save::SavePlan> {
        let mut state = self.borrow_state(operation)?;
        if self.auto_detect.get() {
            self.run_detection(&mut state)?;
        }
        save::plan_save(&state)
    }

    fn finish_save(&self, plan: &save::SavePlan, results: &[WriteResult], start: Instant) -> Result<usize> {
        let written = {
            let mut state = self.borrow_state("save_changes")?;
            save::apply_results(
                &mut state,
                plan,
                results,
                self.config.accept_all_changes_on_success,
            )
        };
        match &written {
            Ok(count) => tracing::info!(
                written = count,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Saved changes"
            ),
            Err(e) if e.is_concurrency_conflict() => {
                tracing::warn!(error = %e, "Save hit a concurrency conflict; reload and retry");
            }
            Err(e) => tracing::warn!(error = %e, "Save failed"),
        }
        written
    }

    fn log_plan(plan: &save::SavePlan) {
        tracing::info!(
            inserts = plan.batch.count(WriteKind::Insert),
            updates = plan.batch.count(WriteKind::Update),
            deletes = plan.batch.count(WriteKind::Delete),
            "Saving changes"
        );
    }

    /// Detect changes (unless disabled), write them through the gateway and
    /// accept them. Returns the number of entries written.
    ///
    /// On any failure no entry changes state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn save_changes(&self) -> Result<usize> {
        let _guard = self.detector.enter("save_changes")?;
        let start = Instant::now();
        let plan = self.prepare_save("save_changes");
        let plan = match plan {
            Ok(plan) if plan.is_empty() => {
                self.dispatch_events();
                return Ok(0);
            }
            Ok(plan) => plan,
            Err(e) => {
                self.dispatch_events();
                return Err(e);
            }
        };
        Self::log_plan(&plan);

        let written = match self.gateway.execute(&plan.batch) {
            Ok(results) => self.finish_save(&plan, &results, start),
            Err(e) => {
                tracing::warn!(error = %e, "Gateway failed");
                Err(e)
            }
        };
        self.dispatch_events();
        written
    }

    /// Asynchronous [`save_changes`](Self::save_changes).
    ///
    /// Detection and ordering run before the gateway call, which is the only
    /// suspension point. Cancellation observed there leaves every entry as it
    /// was and is reported as [`Outcome::Cancelled`]. A second asynchronous
    /// save started while this one is suspended fails with
    /// [`Error::ConcurrentAccess`].
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn save_changes_async(&self, cx: &Cx) -> Outcome<usize, Error> {
        let _guard = match self.detector.enter("save_changes_async") {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let start = Instant::now();
        let plan = match self.prepare_save("save_changes_async") {
            Ok(plan) if plan.is_empty() => {
                self.dispatch_events();
                return Outcome::Ok(0);
            }
            Ok(plan) => plan,
            Err(e) => {
                self.dispatch_events();
                return Outcome::Err(e);
            }
        };
        Self::log_plan(&plan);

        let results = match self.gateway.execute_async(cx, &plan.batch).await {
            Outcome::Ok(results) => results,
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Gateway failed");
                self.dispatch_events();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                tracing::info!("Save cancelled");
                self.dispatch_events();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let written = self.finish_save(&plan, &results, start);
        self.dispatch_events();
        match written {
            Ok(count) => Outcome::Ok(count),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Accept every entry: originals refreshed, Added and Modified become
    /// Unchanged, Deleted entries are evicted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_all_changes(&self) -> Result<()> {
        self.mutate("accept_all_changes", |sm| {
            save::accept_all(sm);
            Ok(())
        })
    }

    /// Detach everything.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear(&self) -> Result<()> {
        self.mutate("clear", |sm| {
            sm.clear();
            Ok(())
        })
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Call `listener` whenever an entity starts being tracked.
    pub fn on_tracked(&self, listener: impl Fn(&Session<G>, &TrackedEvent) + 'static) {
        self.tracked_listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Call `listener` whenever a tracked entity changes state.
    pub fn on_state_changed(&self, listener: impl Fn(&Session<G>, &StateChangedEvent) + 'static) {
        self.state_listeners.borrow_mut().push(Rc::new(listener));
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let mut info = self.read(|sm| SessionDebugInfo {
            tracked: sm.len(),
            identity_slots: sm.identity_len(),
            unchanged: sm.count(EntityState::Unchanged),
            added: sm.count(EntityState::Added),
            modified: sm.count(EntityState::Modified),
            deleted: sm.count(EntityState::Deleted),
            busy: false,
        });
        info.busy = self.detector.is_busy();
        info
    }
}

impl<G: PersistenceGateway> fmt::Debug for Session<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("auto_detect", &self.auto_detect.get())
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

fn add_one(sm: &mut StateManager, entity: &EntityRef) -> Result<()> {
    if let Some(id) = sm.entry_id_of(entity) {
        if sm.state(id) == EntityState::Deleted {
            sm.set_state_raw(id, EntityState::Unchanged);
            sm.refresh_from_flags(id);
            return Ok(());
        }
    }
    graph_attacher::attach_graph(sm, entity, EntityState::Added).map(drop)
}

fn remove_one(sm: &mut StateManager, entity: &EntityRef) -> Result<()> {
    match sm.entry_id_of(entity) {
        Some(id) => NavigationFixer::new(sm).delete(id),
        None => graph_attacher::attach_graph(sm, entity, EntityState::Deleted).map(drop),
    }
}

fn not_tracked(entity: &EntityRef) -> Error {
    let name = entity.borrow().entity_type().to_string();
    Error::InvalidOperation(format!("entity of type '{name}' is not tracked"))
}

/// Entry and property index of a tracked entity's property.
fn locate(sm: &StateManager, entity: &EntityRef, property: &str) -> Result<(EntryId, usize)> {
    let id = sm.entry_id_of(entity).ok_or_else(|| not_tracked(entity))?;
    let type_index = sm.type_index(id).ok_or_else(|| not_tracked(entity))?;
    let et = sm.model().entity_type_at(type_index);
    let idx = et.property_index(property).ok_or_else(|| Error::UnknownProperty {
        entity_type: et.name().to_string(),
        property: property.to_string(),
    })?;
    Ok((id, idx))
}

/// Debug information about session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Tracked entries.
    pub tracked: usize,
    /// Occupied identity-map slots.
    pub identity_slots: usize,
    /// Unchanged entries.
    pub unchanged: usize,
    /// Entries pending INSERT.
    pub added: usize,
    /// Entries pending UPDATE.
    pub modified: usize,
    /// Entries pending DELETE.
    pub deleted: usize,
    /// Whether an operation is in progress.
    pub busy: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================
