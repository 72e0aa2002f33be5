//! The consumed contract of the remote REST facade.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::FacadeResult;

/// File type codes as reported by the facade's `ls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Block,
    Char,
    Directory,
    Symlink,
    Socket,
    Fifo,
    Regular,
}

impl FileType {
    /// Parse the facade's one-letter code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "b" => Some(FileType::Block),
            "c" => Some(FileType::Char),
            "d" => Some(FileType::Directory),
            "l" => Some(FileType::Symlink),
            "s" => Some(FileType::Socket),
            "p" => Some(FileType::Fifo),
            "-" => Some(FileType::Regular),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FileType::Block => "b",
            FileType::Char => "c",
            FileType::Directory => "d",
            FileType::Symlink => "l",
            FileType::Socket => "s",
            FileType::Fifo => "p",
            FileType::Regular => "-",
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsEntry {
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    #[serde(default)]
    pub link_target: Option<String>,
}

/// Result of a remote `stat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatRecord {
    pub size: u64,
    pub mtime: i64,
}

/// One scheduler accounting record; `state` is the scheduler's job state
/// string (`COMPLETED` when finished).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub jobid: String,
    pub state: String,
}

/// Parameters of a signed-URL upload, as handed out by the facade.
///
/// The upload is a POST of a multipart form whose first field is the file
/// content and whose remaining fields are the `data` entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadParameters {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub json: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Handle for one staged upload.
#[async_trait]
pub trait UploadHandle: Send {
    /// Whether the facade still reports the transfer as in progress.
    async fn in_progress(&mut self) -> FacadeResult<bool>;

    /// The signed-URL parameters to POST the content to.
    fn parameters(&self) -> &UploadParameters;

    /// Drop the facade-side handle once the transfer is done with.
    async fn invalidate(&mut self) -> FacadeResult<()>;
}

/// Handle for one staged download.
#[async_trait]
pub trait DownloadHandle: Send {
    async fn in_progress(&mut self) -> FacadeResult<bool>;

    /// The signed URL to GET; only available once no longer in progress.
    fn url(&self) -> FacadeResult<String>;

    async fn invalidate(&mut self) -> FacadeResult<()>;
}

/// The facade's verbs, one method per endpoint.
///
/// Implementations must be re-entrant: one client is cached per stored
/// client row and shared across that client's jobs.
#[async_trait]
pub trait FacadeClient: Send + Sync {
    /// Create a directory, optionally with its missing parents.
    async fn mkdir(&self, machine: &str, path: &str, parents: bool) -> FacadeResult<()>;

    /// Upload a small file directly.
    async fn simple_upload(
        &self,
        machine: &str,
        content: &[u8],
        target_dir: &str,
        filename: &str,
    ) -> FacadeResult<()>;

    /// Download a small file directly.
    async fn simple_download(&self, machine: &str, remote_path: &str) -> FacadeResult<Vec<u8>>;

    /// Begin a staged upload via the facade's object storage.
    async fn external_upload(
        &self,
        machine: &str,
        filename: &str,
        target_dir: &str,
    ) -> FacadeResult<Box<dyn UploadHandle>>;

    /// Begin a staged download via the facade's object storage.
    async fn external_download(
        &self,
        machine: &str,
        remote_path: &str,
    ) -> FacadeResult<Box<dyn DownloadHandle>>;

    /// Submit the batch script at `script_path`, returning the scheduler's
    /// job id.
    async fn submit(&self, machine: &str, script_path: &str) -> FacadeResult<String>;

    /// Poll the scheduler for the given job ids.
    async fn poll(&self, machine: &str, job_ids: &[String]) -> FacadeResult<Vec<JobRecord>>;

    /// List a directory.
    async fn list_files(
        &self,
        machine: &str,
        path: &str,
        show_hidden: bool,
    ) -> FacadeResult<Vec<LsEntry>>;

    /// Stat a path; absent paths error with `NotFound`.
    async fn stat(&self, machine: &str, path: &str) -> FacadeResult<StatRecord>;

    /// SHA-256 checksum of a remote file, lowercase hex.
    async fn checksum(&self, machine: &str, path: &str) -> FacadeResult<String>;
}
