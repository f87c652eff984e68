//! Operation Dispatcher
//!
//! Pure routing of decoded log entries. Decides what an entry means for the
//! mirror without touching the store or the tree, so the relay loop only
//! has to execute the returned `Route`.

use crate::domain::entities::{Command, Document, LogEntry, Operation};
use crate::domain::value_objects::{DocumentId, Namespace};

/// What the relay must do for one log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Create-or-update the topic from the embedded document
    Transcribe(Document),
    /// Re-read the full document from the source, then create-or-update
    Refetch(DocumentId),
    /// Remove the document's topic and everything below it
    Remove(DocumentId),
    /// Remove every topic under the root and forget all identities
    DropCollection,
    /// Nothing to do
    Ignore(IgnoreReason),
}

/// Why an entry produced no mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Entry came from a namespace other than the mirrored one
    ForeignNamespace(String),
    /// A drop of some other collection in the same database
    OtherCollectionDropped(String),
    /// Collection-level command with no effect on documents
    UnhandledCommand(String),
    /// Operation kind the mirror does not know
    UnknownOperation(String),
}

/// Routes log entries for one source collection.
#[derive(Debug, Clone)]
pub struct OperationDispatcher {
    namespace: Namespace,
    command_namespace: Namespace,
}

impl OperationDispatcher {
    pub fn new(namespace: Namespace) -> Self {
        let command_namespace = namespace.command_namespace();
        Self {
            namespace,
            command_namespace,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Classify `entry`.
    ///
    /// Document operations must originate in the mirrored namespace; command
    /// entries are matched against the database's `$cmd` namespace instead.
    pub fn route(&self, entry: LogEntry) -> Route {
        let expected = match entry.operation {
            Operation::Command(_) => &self.command_namespace,
            _ => &self.namespace,
        };
        if entry.namespace != *expected {
            return Route::Ignore(IgnoreReason::ForeignNamespace(entry.namespace.to_string()));
        }

        match entry.operation {
            Operation::Insert { document } => Route::Transcribe(document),
            Operation::Update { id, .. } => Route::Refetch(id),
            Operation::Delete { id } => Route::Remove(id),
            Operation::Command(Command::Drop { collection }) => {
                if collection == self.namespace.collection {
                    Route::DropCollection
                } else {
                    Route::Ignore(IgnoreReason::OtherCollectionDropped(collection))
                }
            }
            Operation::Command(Command::Other { name }) => {
                Route::Ignore(IgnoreReason::UnhandledCommand(name))
            }
            Operation::Other { kind } => Route::Ignore(IgnoreReason::UnknownOperation(kind)),
        }
    }
}
