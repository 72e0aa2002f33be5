//! reqwest implementation of the facade contract.
//!
//! Authentication is OAuth client credentials against the client's token
//! endpoint; the bearer token is cached and refreshed shortly before it
//! expires. Synchronous verbs live under `/utilities/*`; long-running verbs
//! (`/compute/*`, `/storage/xfer-external/*`) answer with a task envelope
//! that is polled until the task settles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::facade::{
    DownloadHandle, FacadeClient, FileType, JobRecord, LsEntry, StatRecord, UploadHandle,
    UploadParameters,
};
use crate::poll::{PollConfig, Poller};
use crate::{FacadeResult, TransportError};

const MACHINE_HEADER: &str = "X-Machine-Name";
const NOT_FOUND_HEADER: &str = "X-Not-Found";
/// Refresh the token this long before the facade would reject it.
const TOKEN_GRACE: Duration = Duration::from_secs(30);

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

struct Inner {
    http: reqwest::Client,
    base_url: Url,
    token_uri: String,
    client_id: String,
    client_secret: String,
    token: tokio::sync::Mutex<Option<CachedToken>>,
    task_poll: PollConfig,
}

/// Facade client over HTTP, one per stored client row.
#[derive(Clone)]
pub struct HttpFacade {
    inner: Arc<Inner>,
}

impl HttpFacade {
    pub fn new(
        client_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_uri: impl Into<String>,
    ) -> FacadeResult<Self> {
        let base_url = Url::parse(client_url)
            .map_err(|err| TransportError::Protocol(format!("bad client URL {client_url:?}: {err}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url,
                token_uri: token_uri.into(),
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                token: tokio::sync::Mutex::new(None),
                task_poll: PollConfig::default(),
            }),
        })
    }

    /// Override how facade task envelopes are polled.
    pub fn with_task_poll(mut self, config: PollConfig) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configured before first use")
            .task_poll = config;
        self
    }
}

impl Inner {
    async fn access_token(&self) -> FacadeResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            expires_in: Option<u64>,
        }

        tracing::debug!(token_uri = %self.token_uri, "fetching access token");
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: format!("token request failed: {}", response.text().await.unwrap_or_default()),
            });
        }
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(300));
        let access_token = token.access_token.clone();
        *guard = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_GRACE),
        });
        Ok(access_token)
    }

    fn endpoint(&self, path: &str) -> FacadeResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Protocol(format!("bad endpoint {path:?}: {err}")))
    }

    async fn check(&self, response: reqwest::Response, context: &str) -> FacadeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if response.headers().contains_key(NOT_FOUND_HEADER) || status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(context.to_string()));
        }
        Err(TransportError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }

    async fn get_json(
        &self,
        machine: &str,
        path: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> FacadeResult<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.endpoint(path)?)
            .bearer_auth(token)
            .header(MACHINE_HEADER, machine)
            .query(query)
            .send()
            .await?;
        Ok(self.check(response, context).await?.json().await?)
    }

    async fn post_form(
        &self,
        machine: &str,
        path: &str,
        form: &[(&str, &str)],
        context: &str,
    ) -> FacadeResult<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.endpoint(path)?)
            .bearer_auth(token)
            .header(MACHINE_HEADER, machine)
            .form(form)
            .send()
            .await?;
        Ok(self.check(response, context).await?.json().await?)
    }

    /// Pull the task id out of a long-running verb's response.
    fn task_id(value: &Value) -> FacadeResult<String> {
        value
            .pointer("/task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol(format!("response carries no task id: {value}")))
    }

    /// One fetch of a task's state: `(done, data)`.
    async fn fetch_task(&self, machine: &str, task_id: &str) -> FacadeResult<(bool, Value)> {
        let value = self
            .get_json(machine, &format!("tasks/{task_id}"), &[], task_id)
            .await?;
        let task = value
            .pointer("/task")
            .cloned()
            .unwrap_or(value);
        let status = task
            .pointer("/status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = task.pointer("/data").cloned().unwrap_or(Value::Null);
        if status.starts_with('4') || status.starts_with('5') {
            return Err(TransportError::Api {
                status: 500,
                message: format!("facade task {task_id} failed: {data}"),
            });
        }
        Ok((status == "200", data))
    }

    /// Poll a task envelope until it settles, returning its data.
    async fn wait_task(&self, machine: &str, task_id: &str) -> FacadeResult<Value> {
        let mut poller = Poller::new("facade task", self.task_poll);
        loop {
            let (done, data) = self.fetch_task(machine, task_id).await?;
            if done {
                return Ok(data);
            }
            poller.tick().await?;
        }
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl FacadeClient for HttpFacade {
    async fn mkdir(&self, machine: &str, path: &str, parents: bool) -> FacadeResult<()> {
        let parents = if parents { "true" } else { "false" };
        self.inner
            .post_form(
                machine,
                "utilities/mkdir",
                &[("targetPath", path), ("p", parents)],
                path,
            )
            .await?;
        Ok(())
    }

    async fn simple_upload(
        &self,
        machine: &str,
        content: &[u8],
        target_dir: &str,
        filename: &str,
    ) -> FacadeResult<()> {
        let token = self.inner.access_token().await?;
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(content.to_vec()).file_name(filename.to_string()),
            )
            .text("targetPath", target_dir.to_string());
        let response = self
            .inner
            .http
            .post(self.inner.endpoint("utilities/upload")?)
            .bearer_auth(token)
            .header(MACHINE_HEADER, machine)
            .multipart(form)
            .send()
            .await?;
        self.inner.check(response, target_dir).await?;
        Ok(())
    }

    async fn simple_download(&self, machine: &str, remote_path: &str) -> FacadeResult<Vec<u8>> {
        let token = self.inner.access_token().await?;
        let response = self
            .inner
            .http
            .get(self.inner.endpoint("utilities/download")?)
            .bearer_auth(token)
            .header(MACHINE_HEADER, machine)
            .query(&[("sourcePath", remote_path)])
            .send()
            .await?;
        let response = self.inner.check(response, remote_path).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn external_upload(
        &self,
        machine: &str,
        filename: &str,
        target_dir: &str,
    ) -> FacadeResult<Box<dyn UploadHandle>> {
        let value = self
            .inner
            .post_form(
                machine,
                "storage/xfer-external/upload",
                &[("targetPath", target_dir), ("sourcePath", filename)],
                target_dir,
            )
            .await?;
        let task_id = Inner::task_id(&value)?;
        // the signed-URL form parameters come with the task's first data
        let data = self.inner.wait_task(machine, &task_id).await?;
        let parameters = data
            .pointer("/parameters")
            .cloned()
            .ok_or_else(|| {
                TransportError::Protocol(format!("upload task carries no parameters: {data}"))
            })?;
        let parameters: UploadParameters = serde_json::from_value(parameters)
            .map_err(|err| TransportError::Protocol(format!("bad upload parameters: {err}")))?;
        Ok(Box::new(HttpUploadHandle {
            inner: self.inner.clone(),
            machine: machine.to_string(),
            task_id,
            parameters,
        }))
    }

    async fn external_download(
        &self,
        machine: &str,
        remote_path: &str,
    ) -> FacadeResult<Box<dyn DownloadHandle>> {
        let value = self
            .inner
            .post_form(
                machine,
                "storage/xfer-external/download",
                &[("sourcePath", remote_path)],
                remote_path,
            )
            .await?;
        let task_id = Inner::task_id(&value)?;
        Ok(Box::new(HttpDownloadHandle {
            inner: self.inner.clone(),
            machine: machine.to_string(),
            task_id,
            url: None,
        }))
    }

    async fn submit(&self, machine: &str, script_path: &str) -> FacadeResult<String> {
        let value = self
            .inner
            .post_form(
                machine,
                "compute/jobs/path",
                &[("targetPath", script_path)],
                script_path,
            )
            .await?;
        let task_id = Inner::task_id(&value)?;
        let data = self.inner.wait_task(machine, &task_id).await?;
        data.pointer("/jobid")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| TransportError::Protocol(format!("submit answered without a jobid: {data}")))
    }

    async fn poll(&self, machine: &str, job_ids: &[String]) -> FacadeResult<Vec<JobRecord>> {
        let jobs = job_ids.join(",");
        let value = self
            .inner
            .get_json(machine, "compute/acct", &[("jobs", jobs.as_str())], &jobs)
            .await?;
        let task_id = Inner::task_id(&value)?;
        let data = self.inner.wait_task(machine, &task_id).await?;
        let records = data
            .as_array()
            .ok_or_else(|| TransportError::Protocol(format!("poll answered without records: {data}")))?;
        records
            .iter()
            .map(|record| {
                let jobid = record
                    .pointer("/jobid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let state = record
                    .pointer("/state")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(JobRecord { jobid, state })
            })
            .collect()
    }

    async fn list_files(
        &self,
        machine: &str,
        path: &str,
        show_hidden: bool,
    ) -> FacadeResult<Vec<LsEntry>> {
        let hidden = if show_hidden { "true" } else { "false" };
        let value = self
            .inner
            .get_json(
                machine,
                "utilities/ls",
                &[("targetPath", path), ("showhidden", hidden)],
                path,
            )
            .await?;
        let entries = value
            .pointer("/output")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        entries
            .iter()
            .map(|entry| {
                let name = entry
                    .pointer("/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = entry.pointer("/type").and_then(Value::as_str).unwrap_or("-");
                let file_type = FileType::from_code(code).ok_or_else(|| {
                    TransportError::Protocol(format!("unknown file type code {code:?} for {name}"))
                })?;
                let size = entry.pointer("/size").map(as_u64).flatten().unwrap_or(0);
                let link_target = entry
                    .pointer("/link_target")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                Ok(LsEntry {
                    name,
                    file_type,
                    size,
                    link_target,
                })
            })
            .collect()
    }

    async fn stat(&self, machine: &str, path: &str) -> FacadeResult<StatRecord> {
        let value = self
            .inner
            .get_json(
                machine,
                "utilities/stat",
                &[("targetPath", path), ("deref", "false")],
                path,
            )
            .await?;
        let output = value.pointer("/output").cloned().unwrap_or(value);
        let size = output
            .pointer("/size")
            .map(as_u64)
            .flatten()
            .ok_or_else(|| TransportError::Protocol(format!("stat answered without a size: {output}")))?;
        let mtime = output.pointer("/mtime").map(as_i64).flatten().unwrap_or(0);
        Ok(StatRecord { size, mtime })
    }

    async fn checksum(&self, machine: &str, path: &str) -> FacadeResult<String> {
        let value = self
            .inner
            .get_json(machine, "utilities/checksum", &[("targetPath", path)], path)
            .await?;
        value
            .pointer("/output")
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase())
            .ok_or_else(|| TransportError::Protocol(format!("checksum answered without a digest: {value}")))
    }
}

struct HttpUploadHandle {
    inner: Arc<Inner>,
    machine: String,
    task_id: String,
    parameters: UploadParameters,
}

#[async_trait]
impl UploadHandle for HttpUploadHandle {
    async fn in_progress(&mut self) -> FacadeResult<bool> {
        let (_, data) = self.inner.fetch_task(&self.machine, &self.task_id).await?;
        Ok(data
            .pointer("/in_progress")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    fn parameters(&self) -> &UploadParameters {
        &self.parameters
    }

    async fn invalidate(&mut self) -> FacadeResult<()> {
        self.inner
            .post_form(
                &self.machine,
                "storage/xfer-external/invalidate",
                &[("task_id", self.task_id.as_str())],
                &self.task_id,
            )
            .await?;
        Ok(())
    }
}

struct HttpDownloadHandle {
    inner: Arc<Inner>,
    machine: String,
    task_id: String,
    url: Option<String>,
}

#[async_trait]
impl DownloadHandle for HttpDownloadHandle {
    async fn in_progress(&mut self) -> FacadeResult<bool> {
        let (done, data) = self.inner.fetch_task(&self.machine, &self.task_id).await?;
        if done {
            // once settled the task's data is the signed URL itself
            self.url = data.as_str().map(str::to_string).or_else(|| {
                data.pointer("/url").and_then(Value::as_str).map(str::to_string)
            });
        }
        Ok(!done)
    }

    fn url(&self) -> FacadeResult<String> {
        self.url.clone().ok_or_else(|| {
            TransportError::Protocol("download URL requested before the transfer settled".to_string())
        })
    }

    async fn invalidate(&mut self) -> FacadeResult<()> {
        self.inner
            .post_form(
                &self.machine,
                "storage/xfer-external/invalidate",
                &[("task_id", self.task_id.as_str())],
                &self.task_id,
            )
            .await?;
        Ok(())
    }
}
