//! In-process persistence gateway.
//!
//! [`MemoryGateway`] keeps one table per entity type and applies each batch
//! transactionally: commands run against a working copy that replaces the
//! committed store only when every command succeeded. It generates integer
//! keys for `OnAdd` properties, refreshes `OnAddOrUpdate` tokens, resolves
//! key propagations, and checks concurrency tokens on update and delete.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ormtrack_core::{EntityType, Model, Result, Value, ValueKind};

use crate::gateway::{PersistenceGateway, WriteBatch, WriteCommand, WriteKind, WriteResult};

/// A stored row: column name to value.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Store {
    tables: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
    version: i64,
}

impl Store {
    fn position(&self, et: &EntityType, key: &[Value]) -> Option<usize> {
        let table = self.tables.get(et.name())?;
        table.iter().position(|row| row_has_key(row, et, key))
    }

    fn next_sequence(&mut self, table: &str) -> i64 {
        let next = self.sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    fn next_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }

    fn generate(&mut self, et: &EntityType, column: &str) -> Value {
        let Some(property) = et.find_property(column) else {
            return Value::Null;
        };
        if property.generated_on_update() {
            let version = self.next_version();
            return match property.kind {
                ValueKind::Bytes => Value::Bytes(version.to_be_bytes().to_vec()),
                ValueKind::Int => Value::Int(i32::try_from(version).unwrap_or(i32::MAX)),
                _ => Value::BigInt(version),
            };
        }
        let n = self.next_sequence(et.name());
        match property.kind {
            ValueKind::Int => Value::Int(i32::try_from(n).unwrap_or(i32::MAX)),
            _ => Value::BigInt(n),
        }
    }

    fn tokens_match(row: &Row, command: &WriteCommand) -> bool {
        command
            .original_tokens
            .iter()
            .all(|(column, expected)| row.get(column).is_some_and(|v| v.same_as(expected)))
    }

    fn apply(
        &mut self,
        et: &EntityType,
        command: &WriteCommand,
        batch: &WriteBatch,
        results: &[WriteResult],
    ) -> WriteResult {
        let key: Vec<Value> = command.key.iter().map(|(_, v)| v.clone()).collect();
        match command.kind {
            WriteKind::Insert => {
                let mut row: Row = command
                    .key
                    .iter()
                    .chain(&command.values)
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect();

                let propagated = propagated_columns(command, batch, results);
                for (column, value) in &propagated {
                    row.insert(column.clone(), value.clone());
                }

                let mut generated = Vec::with_capacity(command.generated.len());
                for column in &command.generated {
                    let value = self.generate(et, column);
                    row.insert(column.clone(), value.clone());
                    generated.push((column.clone(), value));
                }
                generated.extend(propagated);

                let stored_key: Vec<Value> = et
                    .key_indices()
                    .iter()
                    .map(|idx| {
                        row.get(&et.property_at(*idx).name)
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                if self.position(et, &stored_key).is_some() {
                    return WriteResult::StorageError(format!(
                        "duplicate key in table {}",
                        et.name()
                    ));
                }
                if let Some(n) = stored_key.iter().find_map(Value::as_i64) {
                    let seq = self.sequences.entry(et.name().to_string()).or_insert(0);
                    *seq = (*seq).max(n);
                }
                self.tables.entry(et.name().to_string()).or_default().push(row);
                WriteResult::Success { generated }
            }
            WriteKind::Update => {
                let Some(pos) = self.position(et, &key) else {
                    return WriteResult::ConcurrencyConflict;
                };
                let mut generated = Vec::with_capacity(command.generated.len());
                let tokens: Vec<Value> = command
                    .generated
                    .iter()
                    .map(|column| self.generate(et, column))
                    .collect();
                let Some(row) = self.tables.get_mut(et.name()).and_then(|t| t.get_mut(pos)) else {
                    return WriteResult::ConcurrencyConflict;
                };
                if !Self::tokens_match(row, command) {
                    return WriteResult::ConcurrencyConflict;
                }
                for (column, value) in &command.values {
                    row.insert(column.clone(), value.clone());
                }
                for (column, value) in command.generated.iter().zip(tokens) {
                    row.insert(column.clone(), value.clone());
                    generated.push((column.clone(), value));
                }
                for (column, value) in propagated_columns(command, batch, results) {
                    row.insert(column.clone(), value.clone());
                    generated.push((column, value));
                }
                WriteResult::Success { generated }
            }
            WriteKind::Delete => {
                let Some(pos) = self.position(et, &key) else {
                    return WriteResult::ConcurrencyConflict;
                };
                let Some(table) = self.tables.get_mut(et.name()) else {
                    return WriteResult::ConcurrencyConflict;
                };
                if !Self::tokens_match(&table[pos], command) {
                    return WriteResult::ConcurrencyConflict;
                }
                table.remove(pos);
                WriteResult::ok()
            }
        }
    }
}

/// Foreign key values copied from principals inserted earlier in the batch.
/// A principal's generated value wins over the value its command carried.
fn propagated_columns(
    command: &WriteCommand,
    batch: &WriteBatch,
    results: &[WriteResult],
) -> Vec<(String, Value)> {
    let mut columns = Vec::new();
    for propagation in &command.key_propagations {
        let principal = batch.commands.get(propagation.principal_command);
        let principal_generated = match results.get(propagation.principal_command) {
            Some(WriteResult::Success { generated }) => generated.as_slice(),
            _ => &[][..],
        };
        for (column, source) in propagation.properties.iter().zip(&propagation.principal_properties) {
            let value = principal_generated
                .iter()
                .find(|(c, _)| c == source)
                .map(|(_, v)| v.clone())
                .or_else(|| principal.and_then(|p| p.value(source)).cloned())
                .unwrap_or(Value::Null);
            columns.push((column.clone(), value));
        }
    }
    columns
}

fn row_has_key(row: &Row, et: &EntityType, key: &[Value]) -> bool {
    et.key_indices()
        .iter()
        .zip(key)
        .all(|(idx, v)| row.get(&et.property_at(*idx).name).is_some_and(|r| r.same_as(v)))
}

/// Transactional in-memory store.
pub struct MemoryGateway {
    model: Arc<Model>,
    store: RefCell<Store>,
    history: RefCell<Vec<WriteBatch>>,
    fail_next: RefCell<Option<String>>,
    executed: Cell<usize>,
}

impl MemoryGateway {
    /// An empty store for `model`.
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            store: RefCell::new(Store::default()),
            history: RefCell::new(Vec::new()),
            fail_next: RefCell::new(None),
            executed: Cell::new(0),
        }
    }

    /// Insert a row directly, bypassing batches.
    pub fn seed<I, S>(&self, entity_type: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let et = self.model.entity_type(entity_type)?;
        let row: Row = columns.into_iter().map(|(c, v)| (c.into(), v)).collect();
        let mut store = self.store.borrow_mut();
        if let Some(n) = et
            .key_indices()
            .iter()
            .filter_map(|idx| row.get(&et.property_at(*idx).name))
            .find_map(Value::as_i64)
        {
            let seq = store.sequences.entry(et.name().to_string()).or_insert(0);
            *seq = (*seq).max(n);
        }
        store.tables.entry(et.name().to_string()).or_default().push(row);
        Ok(())
    }

    /// The committed row with this key.
    pub fn row(&self, entity_type: &str, key: &[Value]) -> Option<Row> {
        let et = self.model.find_entity_type(entity_type)?;
        let store = self.store.borrow();
        let pos = store.position(et, key)?;
        store.tables.get(et.name()).and_then(|t| t.get(pos)).cloned()
    }

    /// Every committed row of a table, in insertion order.
    pub fn rows(&self, entity_type: &str) -> Vec<Row> {
        self.store
            .borrow()
            .tables
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite a committed column, as another writer would.
    pub fn set_stored_value(&self, entity_type: &str, key: &[Value], column: &str, value: Value) -> bool {
        let Some(et) = self.model.find_entity_type(entity_type) else {
            return false;
        };
        let mut store = self.store.borrow_mut();
        let Some(pos) = store.position(et, key) else {
            return false;
        };
        match store.tables.get_mut(et.name()).and_then(|t| t.get_mut(pos)) {
            Some(row) => {
                row.insert(column.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Make the next executed command fail with a storage error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        *self.fail_next.borrow_mut() = Some(message.into());
    }

    /// Batches received so far, committed or not.
    pub fn batches(&self) -> Vec<WriteBatch> {
        self.history.borrow().clone()
    }

    /// Number of batches received.
    pub fn executed(&self) -> usize {
        self.executed.get()
    }
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.borrow();
        f.debug_struct("MemoryGateway")
            .field("tables", &store.tables.len())
            .field("rows", &store.tables.values().map(Vec::len).sum::<usize>())
            .field("executed", &self.executed.get())
            .finish()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn execute(&self, batch: &WriteBatch) -> Result<Vec<WriteResult>> {
        self.executed.set(self.executed.get() + 1);
        self.history.borrow_mut().push(batch.clone());

        let mut work = self.store.borrow().clone();
        let mut results = Vec::with_capacity(batch.len());
        for command in &batch.commands {
            let result = match self.fail_next.borrow_mut().take() {
                Some(message) => WriteResult::StorageError(message),
                None => {
                    let et = self.model.entity_type(&command.entity_type)?;
                    work.apply(et, command, batch, &results)
                }
            };
            let failed = !result.is_success();
            results.push(result);
            if failed {
                tracing::debug!(
                    entity_type = %command.entity_type,
                    kind = ?command.kind,
                    "Batch rolled back"
                );
                return Ok(results);
            }
        }

        *self.store.borrow_mut() = work;
        tracing::debug!(commands = batch.len(), "Batch committed");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::KeyPropagation;
    use ormtrack_core::{ForeignKey, Property, ValueGenerated};

    fn model() -> Arc<Model> {
        Arc::new(
            Model::builder()
                .entity(
                    EntityType::new("Blog")
                        .property(
                            Property::new("id", ValueKind::BigInt)
                                .key()
                                .generated(ValueGenerated::OnAdd),
                        )
                        .property(Property::new("name", ValueKind::Text))
                        .property(
                            Property::new("version", ValueKind::BigInt)
                                .concurrency_token()
                                .generated(ValueGenerated::OnAddOrUpdate),
                        ),
                )
                .entity(
                    EntityType::new("Post")
                        .property(
                            Property::new("id", ValueKind::BigInt)
                                .key()
                                .generated(ValueGenerated::OnAdd),
                        )
                        .property(Property::new("blog_id", ValueKind::BigInt)),
                )
                .relationship(ForeignKey::new("Post", ["blog_id"], "Blog"))
                .build()
                .unwrap(),
        )
    }

    fn insert_blog(name: &str) -> WriteCommand {
        WriteCommand {
            kind: WriteKind::Insert,
            entity_type: "Blog".into(),
            key: vec![("id".into(), Value::BigInt(0))],
            values: vec![("name".into(), Value::from(name))],
            original_tokens: Vec::new(),
            generated: vec!["id".into(), "version".into()],
            key_propagations: Vec::new(),
        }
    }

    #[test]
    fn test_insert_generates_key_and_token() {
        let gw = MemoryGateway::new(model());
        let batch = WriteBatch {
            commands: vec![insert_blog("a")],
        };
        let results = gw.execute(&batch).unwrap();
        assert_eq!(
            results,
            vec![WriteResult::Success {
                generated: vec![
                    ("id".into(), Value::BigInt(1)),
                    ("version".into(), Value::BigInt(1)),
                ]
            }]
        );
        assert!(gw.row("Blog", &[Value::BigInt(1)]).is_some());
    }

    #[test]
    fn test_key_propagation_copies_generated_key() {
        let gw = MemoryGateway::new(model());
        gw.seed("Blog", [("id", Value::BigInt(4)), ("name", Value::from("old"))])
            .unwrap();
        let post = WriteCommand {
            kind: WriteKind::Insert,
            entity_type: "Post".into(),
            key: vec![("id".into(), Value::BigInt(0))],
            values: vec![("blog_id".into(), Value::BigInt(0))],
            original_tokens: Vec::new(),
            generated: vec!["id".into()],
            key_propagations: vec![KeyPropagation {
                properties: vec!["blog_id".into()],
                principal_command: 0,
                principal_properties: vec!["id".into()],
            }],
        };
        let batch = WriteBatch {
            commands: vec![insert_blog("a"), post],
        };
        gw.execute(&batch).unwrap();
        let rows = gw.rows("Post");
        assert_eq!(rows[0].get("blog_id"), Some(&Value::BigInt(5)));
    }

    #[test]
    fn test_update_resolves_key_propagation() {
        let gw = MemoryGateway::new(model());
        gw.seed("Blog", [("id", Value::BigInt(1)), ("name", Value::from("old"))])
            .unwrap();
        gw.seed("Post", [("id", Value::BigInt(10)), ("blog_id", Value::BigInt(1))])
            .unwrap();
        let repoint = WriteCommand {
            kind: WriteKind::Update,
            entity_type: "Post".into(),
            key: vec![("id".into(), Value::BigInt(10))],
            values: vec![("blog_id".into(), Value::BigInt(0))],
            original_tokens: Vec::new(),
            generated: Vec::new(),
            key_propagations: vec![KeyPropagation {
                properties: vec!["blog_id".into()],
                principal_command: 0,
                principal_properties: vec!["id".into()],
            }],
        };
        let results = gw
            .execute(&WriteBatch {
                commands: vec![insert_blog("new"), repoint],
            })
            .unwrap();
        assert_eq!(
            results[1],
            WriteResult::Success {
                generated: vec![("blog_id".into(), Value::BigInt(2))]
            }
        );
        let row = gw.row("Post", &[Value::BigInt(10)]).unwrap();
        assert_eq!(row.get("blog_id"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_stale_token_is_a_conflict() {
        let gw = MemoryGateway::new(model());
        gw.seed(
            "Blog",
            [
                ("id", Value::BigInt(1)),
                ("name", Value::from("a")),
                ("version", Value::BigInt(1)),
            ],
        )
        .unwrap();
        gw.set_stored_value("Blog", &[Value::BigInt(1)], "version", Value::BigInt(2));
        let update = WriteCommand {
            kind: WriteKind::Update,
            entity_type: "Blog".into(),
            key: vec![("id".into(), Value::BigInt(1))],
            values: vec![("name".into(), Value::from("b"))],
            original_tokens: vec![("version".into(), Value::BigInt(1))],
            generated: vec!["version".into()],
            key_propagations: Vec::new(),
        };
        let results = gw.execute(&WriteBatch { commands: vec![update] }).unwrap();
        assert_eq!(results, vec![WriteResult::ConcurrencyConflict]);
        let row = gw.row("Blog", &[Value::BigInt(1)]).unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("a")));
    }

    #[test]
    fn test_failure_rolls_back_whole_batch() {
        let gw = MemoryGateway::new(model());
        let delete_missing = WriteCommand {
            kind: WriteKind::Delete,
            entity_type: "Blog".into(),
            key: vec![("id".into(), Value::BigInt(99))],
            values: Vec::new(),
            original_tokens: Vec::new(),
            generated: Vec::new(),
            key_propagations: Vec::new(),
        };
        let batch = WriteBatch {
            commands: vec![insert_blog("a"), delete_missing],
        };
        let results = gw.execute(&batch).unwrap();
        assert_eq!(results.len(), 2);
        assert!(gw.rows("Blog").is_empty());
        assert_eq!(gw.executed(), 1);
    }

    #[test]
    fn test_fail_next_write() {
        let gw = MemoryGateway::new(model());
        gw.fail_next_write("disk full");
        let results = gw
            .execute(&WriteBatch {
                commands: vec![insert_blog("a")],
            })
            .unwrap();
        assert_eq!(results, vec![WriteResult::StorageError("disk full".into())]);
        assert!(gw.rows("Blog").is_empty());
    }
}
