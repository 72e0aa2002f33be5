//! Durable storage for workflow entities and their file payloads.
//!
//! Two stores live side by side in a project directory:
//!
//! - a relational entity graph (client -> code -> calcjob -> process, with
//!   output data nodes) backed by SQLite, see [`Storage`];
//! - a content-addressed object store keyed by SHA-256, used both for job
//!   inputs and retrieved outputs, see [`ObjectStore`].
//!
//! Rows read out of [`Storage`] are value snapshots: mutating a returned row
//! changes nothing until it is written back through the store.

pub mod db;
pub mod entity;
pub mod filter;
pub mod ingest;
pub mod object_store;

pub use db::Storage;
pub use entity::{
    CalcJob, Client, Code, DataNode, FileSystem, Process, Row, State, Step, UploadPaths,
};
pub use filter::{Filter, FilterStringError};
pub use ingest::{AddedPks, IngestConfig};
pub use object_store::{FileObjectStore, InMemoryObjectStore, ObjectStore};

/// Errors raised by the entity and object stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Bad user input: malformed config, relative-path violations, unknown
    /// labels and the like.
    #[error("invalid input: {0}")]
    Validation(String),

    /// An object key that is not present in the object store.
    #[error("object {0} not found in store")]
    ObjectNotFound(String),

    /// A row lookup that matched nothing.
    #[error("{entity}({pk}) not found")]
    RowNotFound { entity: &'static str, pk: i64 },

    /// Saving a row whose primary key is already assigned.
    #[error("cannot save {0}: already saved")]
    AlreadySaved(String),

    /// Deleting a row that other rows reference by foreign key.
    #[error("{0} is likely a dependency for other rows")]
    Undeletable(String),

    /// A filter string that could not be parsed or resolved.
    #[error(transparent)]
    Filter(#[from] FilterStringError),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
