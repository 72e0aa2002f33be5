//! Policy layer over the facade: transfer thresholding and the staged
//! upload/download protocols.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use crate::facade::{FacadeClient, FileType, JobRecord, LsEntry, StatRecord, UploadParameters};
use crate::poll::{PollConfig, Poller};
use crate::remote_path::RemotePath;
use crate::{FacadeResult, TransportError};

/// Private address handed out by facade test deployments; rewritten to
/// localhost when local testing is on.
const LOCAL_TESTING_HOST: &str = "192.168.220.19";

/// Direct HTTP against the signed object-storage URLs the facade hands out.
///
/// Kept separate from [`FacadeClient`]: these requests go to the object
/// store, not the facade, and carry no facade auth.
#[async_trait]
pub trait StagingClient: Send + Sync {
    /// POST a multipart form to the signed upload URL: the file content is
    /// the first field, the handle's `data` entries follow.
    async fn post_form(
        &self,
        params: &UploadParameters,
        filename: &str,
        content: Vec<u8>,
    ) -> FacadeResult<()>;

    /// GET the body behind a signed download URL.
    async fn get(&self, url: &str) -> FacadeResult<Vec<u8>>;
}

pub struct HttpStagingClient {
    http: reqwest::Client,
    /// Swap the facade's fixed private IP for localhost, and read download
    /// URLs straight off the filesystem. For test deployments only.
    local_testing: bool,
}

impl HttpStagingClient {
    pub fn new(local_testing: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            local_testing,
        }
    }
}

#[async_trait]
impl StagingClient for HttpStagingClient {
    async fn post_form(
        &self,
        params: &UploadParameters,
        filename: &str,
        content: Vec<u8>,
    ) -> FacadeResult<()> {
        let url = if self.local_testing {
            params.url.replace(LOCAL_TESTING_HOST, "localhost")
        } else {
            params.url.clone()
        };
        let mut form = Form::new().part(
            "file",
            Part::bytes(content).file_name(filename.to_string()),
        );
        for (key, value) in &params.data {
            form = form.text(key.clone(), value.clone());
        }
        let mut request = self.http.post(&url).multipart(form);
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        if !params.params.is_empty() {
            request = request.query(&params.params);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> FacadeResult<Vec<u8>> {
        if self.local_testing {
            // the signed URL does not resolve against a local deployment;
            // read the object store's backing file directly instead
            let parsed = url::Url::parse(url)
                .map_err(|err| TransportError::Protocol(format!("bad signed URL {url:?}: {err}")))?;
            return Ok(std::fs::read(parsed.path())?);
        }
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// One client's transport: the facade handle plus transfer policy.
///
/// Cached per client row and shared across that client's jobs.
pub struct Transport {
    facade: Arc<dyn FacadeClient>,
    staging: Arc<dyn StagingClient>,
    machine: String,
    sep: char,
    /// Inclusive boundary: sizes up to this use simple transfer.
    small_file_limit: u64,
    transfer_poll: PollConfig,
}

impl Transport {
    pub fn new(
        facade: Arc<dyn FacadeClient>,
        staging: Arc<dyn StagingClient>,
        machine: impl Into<String>,
        sep: char,
        small_file_limit: u64,
        transfer_poll: PollConfig,
    ) -> Self {
        Self {
            facade,
            staging,
            machine: machine.into(),
            sep,
            small_file_limit,
            transfer_poll,
        }
    }

    pub fn separator(&self) -> char {
        self.sep
    }

    pub fn small_file_limit(&self) -> u64 {
        self.small_file_limit
    }

    /// A [`RemotePath`] rooted at `path`, known to be a directory.
    pub fn dir_path(&self, path: &str) -> RemotePath {
        RemotePath::with_metadata(
            self.facade.clone(),
            self.machine.clone(),
            path,
            self.sep,
            FileType::Directory,
            0,
        )
    }

    pub async fn mkdir(&self, path: &str, parents: bool) -> FacadeResult<()> {
        self.facade.mkdir(&self.machine, path, parents).await
    }

    /// Upload in-memory content via the simple path, regardless of size.
    pub async fn upload_bytes(
        &self,
        target_dir: &str,
        filename: &str,
        content: &[u8],
    ) -> FacadeResult<()> {
        self.facade
            .simple_upload(&self.machine, content, target_dir, filename)
            .await
    }

    /// Upload one object, choosing simple or staged transfer by size.
    pub async fn upload(
        &self,
        target_dir: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> FacadeResult<()> {
        if content.len() as u64 <= self.small_file_limit {
            tracing::debug!(filename, size = content.len(), "simple upload");
            return self
                .facade
                .simple_upload(&self.machine, &content, target_dir, filename)
                .await;
        }
        tracing::debug!(filename, size = content.len(), "staged upload");
        let mut handle = self
            .facade
            .external_upload(&self.machine, filename, target_dir)
            .await?;
        let params = handle.parameters().clone();
        self.staging.post_form(&params, filename, content).await?;
        let mut poller = Poller::new("object transfer", self.transfer_poll);
        while handle.in_progress().await? {
            poller.tick().await?;
        }
        Ok(())
    }

    /// Download one file, choosing simple or staged transfer by size.
    pub async fn download(&self, remote_path: &str, size: u64) -> FacadeResult<Vec<u8>> {
        if size <= self.small_file_limit {
            tracing::debug!(remote_path, size, "simple download");
            return self.facade.simple_download(&self.machine, remote_path).await;
        }
        tracing::debug!(remote_path, size, "staged download");
        let mut handle = self
            .facade
            .external_download(&self.machine, remote_path)
            .await?;
        let mut poller = Poller::new("object transfer", self.transfer_poll);
        while handle.in_progress().await? {
            poller.tick().await?;
        }
        let url = handle.url()?;
        let content = self.staging.get(&url).await?;
        handle.invalidate().await?;
        Ok(content)
    }

    pub async fn submit(&self, script_path: &str) -> FacadeResult<String> {
        self.facade.submit(&self.machine, script_path).await
    }

    pub async fn poll(&self, job_ids: &[String]) -> FacadeResult<Vec<JobRecord>> {
        self.facade.poll(&self.machine, job_ids).await
    }

    pub async fn stat(&self, path: &str) -> FacadeResult<StatRecord> {
        self.facade.stat(&self.machine, path).await
    }

    pub async fn checksum(&self, path: &str) -> FacadeResult<String> {
        self.facade.checksum(&self.machine, path).await
    }

    pub async fn list_files(&self, path: &str, show_hidden: bool) -> FacadeResult<Vec<LsEntry>> {
        self.facade.list_files(&self.machine, path, show_hidden).await
    }

    /// Depth-first recursive listing, yielding full paths with their
    /// entries.
    pub async fn list_files_recurse(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> FacadeResult<Vec<(String, LsEntry)>> {
        let mut out = Vec::new();
        let mut stack = vec![path.trim_end_matches(self.sep).to_string()];
        while let Some(current) = stack.pop() {
            for entry in self
                .facade
                .list_files(&self.machine, &current, show_hidden)
                .await?
            {
                let child = format!("{current}{}{}", self.sep, entry.name);
                if entry.file_type == FileType::Directory {
                    stack.push(child.clone());
                }
                out.push((child, entry));
            }
        }
        Ok(out)
    }
}
