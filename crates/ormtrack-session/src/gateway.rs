//! Persistence gateway contract.
//!
//! The save coordinator turns the tracked write set into an ordered
//! [`WriteBatch`] and hands it to a [`PersistenceGateway`]. The gateway owns
//! everything below that line: statement generation, connections and
//! transactions. It reports one [`WriteResult`] per command, in order.

use std::future::Future;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

use ormtrack_core::{Result, Value};

/// What a command does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Insert a new row.
    Insert,
    /// Update an existing row.
    Update,
    /// Delete an existing row.
    Delete,
}

/// Copy a principal's key into this command's foreign key columns.
///
/// Emitted when the principal is inserted earlier in the same batch and its
/// key is store-generated, so the dependent's foreign key is not known until
/// the principal's insert has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPropagation {
    /// Foreign key columns on this command's row.
    pub properties: Vec<String>,
    /// Index of the principal's insert within the batch.
    pub principal_command: usize,
    /// Principal key columns, aligned with `properties`.
    pub principal_properties: Vec<String>,
}

/// One row-level write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand {
    /// Insert, update or delete.
    pub kind: WriteKind,
    /// Entity type name.
    pub entity_type: String,
    /// Key columns and values identifying the row. Store-generated key
    /// columns of an insert carry their default value.
    pub key: Vec<(String, Value)>,
    /// Columns to write. All non-generated columns for an insert, the modified
    /// columns for an update, nothing for a delete.
    pub values: Vec<(String, Value)>,
    /// Concurrency tokens and the values they held when the row was read.
    /// The row matches only if every token still holds its value.
    pub original_tokens: Vec<(String, Value)>,
    /// Columns the store must generate and return.
    pub generated: Vec<String>,
    /// Foreign keys to fill from principals inserted earlier in the batch.
    pub key_propagations: Vec<KeyPropagation>,
}

impl WriteCommand {
    /// Value written to (or identifying) a column.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .chain(self.key.iter())
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }
}

/// An ordered batch of writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Commands in execution order.
    pub commands: Vec<WriteCommand>,
}

impl WriteBatch {
    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Count commands of one kind.
    pub fn count(&self, kind: WriteKind) -> usize {
        self.commands.iter().filter(|c| c.kind == kind).count()
    }
}

/// Per-command outcome reported by a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteResult {
    /// The row was written. Carries store-generated values, if any.
    Success {
        /// Generated column values.
        generated: Vec<(String, Value)>,
    },
    /// The expected row was not found with the expected token values.
    ConcurrencyConflict,
    /// Any other failure.
    StorageError(String),
}

impl WriteResult {
    /// Success without generated values.
    pub fn ok() -> Self {
        WriteResult::Success {
            generated: Vec::new(),
        }
    }

    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, WriteResult::Success { .. })
    }
}

/// Executes write batches against a store.
///
/// Results are returned per command, in batch order. A gateway may stop at the
/// first failing command; a shorter result list is only acceptable when its
/// last entry is a failure. An `Err` from the gateway itself (as opposed to a
/// failed command) is surfaced to the caller unchanged.
pub trait PersistenceGateway {
    /// Execute a batch synchronously.
    fn execute(&self, batch: &WriteBatch) -> Result<Vec<WriteResult>>;

    /// Execute a batch asynchronously.
    ///
    /// This is the only suspension point of an asynchronous save. The default
    /// implementation checks for cancellation and runs [`execute`](Self::execute).
    fn execute_async(
        &self,
        cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, ormtrack_core::Error>> {
        let result = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => match self.execute(batch) {
                Ok(results) => Outcome::Ok(results),
                Err(e) => Outcome::Err(e),
            },
        };
        async move { result }
    }
}

impl<G: PersistenceGateway + ?Sized> PersistenceGateway for &G {
    fn execute(&self, batch: &WriteBatch) -> Result<Vec<WriteResult>> {
        (**self).execute(batch)
    }

    fn execute_async(
        &self,
        cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, ormtrack_core::Error>> {
        (**self).execute_async(cx, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_value_looks_at_values_then_key() {
        let cmd = WriteCommand {
            kind: WriteKind::Update,
            entity_type: "Blog".into(),
            key: vec![("id".into(), Value::BigInt(1))],
            values: vec![("name".into(), Value::Text("B".into()))],
            original_tokens: Vec::new(),
            generated: Vec::new(),
            key_propagations: Vec::new(),
        };
        assert_eq!(cmd.value("name"), Some(&Value::Text("B".into())));
        assert_eq!(cmd.value("id"), Some(&Value::BigInt(1)));
        assert_eq!(cmd.value("missing"), None);
    }

    #[test]
    fn test_batch_counts() {
        let batch = WriteBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.count(WriteKind::Insert), 0);
        assert!(WriteResult::ok().is_success());
        assert!(!WriteResult::ConcurrencyConflict.is_success());
    }

    #[test]
    fn test_batch_serializes() {
        let batch = WriteBatch {
            commands: vec![WriteCommand {
                kind: WriteKind::Delete,
                entity_type: "Post".into(),
                key: vec![("id".into(), Value::BigInt(3))],
                values: Vec::new(),
                original_tokens: Vec::new(),
                generated: Vec::new(),
                key_propagations: Vec::new(),
            }],
        };
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"Delete\""));
        let back: WriteBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
