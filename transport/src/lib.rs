//! Transport to the remote REST facade.
//!
//! The [`FacadeClient`] trait is the consumed contract of the facade (an HTTP
//! front over job submission, scheduler polling, small-file transfer and
//! signed-URL staging). [`HttpFacade`] speaks it over the wire; the
//! [`mock`] module ships an in-memory implementation for tests, the same way
//! the facade would behave against a single remote machine.
//!
//! [`Transport`] sits on top and applies policy: the small-file threshold
//! between simple and staged transfer, the staged upload/download protocols,
//! and the polling loops.

pub mod adapter;
pub mod facade;
pub mod glob;
pub mod http;
pub mod mock;
pub mod poll;
pub mod remote_path;

pub use adapter::{HttpStagingClient, StagingClient, Transport};
pub use facade::{
    DownloadHandle, FacadeClient, FileType, JobRecord, LsEntry, StatRecord, UploadHandle,
    UploadParameters,
};
pub use glob::glob;
pub use http::HttpFacade;
pub use poll::{PollConfig, Poller};
pub use remote_path::RemotePath;

/// Errors raised while talking to the remote facade.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The facade answered with a non-success status.
    #[error("remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A polling loop passed its deadline; the message is fixed per loop.
    #[error("{0}")]
    Timeout(String),

    #[error("remote path not found: {0}")]
    NotFound(String),

    /// The facade answered with something the protocol does not allow.
    #[error("{0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FacadeResult<T> = Result<T, TransportError>;
