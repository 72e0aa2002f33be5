//! An in-memory facade for tests.
//!
//! Models one remote machine: a file tree, a scheduler that yields a
//! configurable sequence of job states, and a staging area standing in for
//! the signed-URL object storage. Call counters let tests assert which
//! transfer path was taken.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::adapter::StagingClient;
use crate::facade::{
    DownloadHandle, FacadeClient, FileType, JobRecord, LsEntry, StatRecord, UploadHandle,
    UploadParameters,
};
use crate::{FacadeResult, TransportError};

#[derive(Debug, Clone)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub mkdirs: usize,
    pub simple_uploads: usize,
    pub external_uploads: usize,
    pub simple_downloads: usize,
    pub external_downloads: usize,
    pub submits: usize,
    pub polls: usize,
    pub lists: usize,
    pub stats: usize,
    pub checksums: usize,
    pub staged_posts: usize,
    pub staged_gets: usize,
    pub invalidations: usize,
}

#[derive(Default)]
struct MockState {
    nodes: BTreeMap<String, Node>,
    /// Remaining states per job id; the last state repeats forever.
    jobs: HashMap<String, VecDeque<String>>,
    next_job_id: u64,
    /// State sequence handed to newly seen jobs.
    job_states: Vec<String>,
    /// Files written into the job directory when a script is submitted.
    outputs_on_submit: Vec<(String, Node)>,
    /// How often a transfer handle reports in-progress before settling.
    transfer_polls: u32,
    /// Signed-URL staging area: url -> pending upload content.
    staged: HashMap<String, Vec<u8>>,
    counters: Counters,
    simple_upload_names: Vec<String>,
    external_upload_names: Vec<String>,
}

#[derive(Clone)]
pub struct MockFacade {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFacade {
    pub fn new() -> Self {
        let state = MockState {
            job_states: vec!["COMPLETED".to_string()],
            transfer_polls: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // -- test configuration --------------------------------------------

    pub fn put_dir(&self, path: &str) {
        let mut state = self.lock();
        ensure_dirs(&mut state.nodes, path);
        state.nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        let mut state = self.lock();
        if let Some(parent) = parent_of(path) {
            ensure_dirs(&mut state.nodes, &parent);
            state.nodes.insert(parent, Node::Dir);
        }
        state.nodes.insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn put_symlink(&self, path: &str, target: &str) {
        let mut state = self.lock();
        if let Some(parent) = parent_of(path) {
            ensure_dirs(&mut state.nodes, &parent);
            state.nodes.insert(parent, Node::Dir);
        }
        state
            .nodes
            .insert(path.to_string(), Node::Symlink(target.to_string()));
    }

    /// The scheduler's answer sequence for every job; the last entry
    /// repeats.
    pub fn set_job_states(&self, states: &[&str]) {
        self.lock().job_states = states.iter().map(|s| s.to_string()).collect();
    }

    /// Files materialized in the job directory at submit time, standing in
    /// for what the script would produce.
    pub fn set_outputs_on_submit(&self, outputs: Vec<(&str, Node)>) {
        self.lock().outputs_on_submit = outputs
            .into_iter()
            .map(|(path, node)| (path.to_string(), node))
            .collect();
    }

    pub fn set_transfer_polls(&self, polls: u32) {
        self.lock().transfer_polls = polls;
    }

    // -- test assertions -----------------------------------------------

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn has_dir(&self, path: &str) -> bool {
        matches!(self.lock().nodes.get(path), Some(Node::Dir))
    }

    /// Filenames that went through the simple upload path.
    pub fn simple_uploaded(&self) -> Vec<String> {
        self.lock().simple_upload_names.clone()
    }

    /// Filenames that went through the staged upload path.
    pub fn external_uploaded(&self) -> Vec<String> {
        self.lock().external_upload_names.clone()
    }
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(trimmed[..idx].to_string())
    }
}

fn ensure_dirs(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        nodes.entry(current.clone()).or_insert(Node::Dir);
    }
}

fn node_size(node: &Node) -> u64 {
    match node {
        Node::Dir => 0,
        Node::File(content) => content.len() as u64,
        Node::Symlink(_) => 0,
    }
}

fn node_type(node: &Node) -> FileType {
    match node {
        Node::Dir => FileType::Directory,
        Node::File(_) => FileType::Regular,
        Node::Symlink(_) => FileType::Symlink,
    }
}

#[async_trait]
impl FacadeClient for MockFacade {
    async fn mkdir(&self, _machine: &str, path: &str, parents: bool) -> FacadeResult<()> {
        let mut state = self.lock();
        state.counters.mkdirs += 1;
        if parents {
            ensure_dirs(&mut state.nodes, path);
        } else if let Some(parent) = parent_of(path) {
            if !matches!(state.nodes.get(&parent), Some(Node::Dir)) {
                return Err(TransportError::Api {
                    status: 400,
                    message: format!("parent directory does not exist: {parent}"),
                });
            }
        }
        state.nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn simple_upload(
        &self,
        _machine: &str,
        content: &[u8],
        target_dir: &str,
        filename: &str,
    ) -> FacadeResult<()> {
        let mut state = self.lock();
        state.counters.simple_uploads += 1;
        state.simple_upload_names.push(filename.to_string());
        if !matches!(state.nodes.get(target_dir), Some(Node::Dir)) {
            return Err(TransportError::Api {
                status: 400,
                message: format!("target directory does not exist: {target_dir}"),
            });
        }
        let path = format!("{}/{filename}", target_dir.trim_end_matches('/'));
        state.nodes.insert(path, Node::File(content.to_vec()));
        Ok(())
    }

    async fn simple_download(&self, _machine: &str, remote_path: &str) -> FacadeResult<Vec<u8>> {
        let mut state = self.lock();
        state.counters.simple_downloads += 1;
        match state.nodes.get(remote_path) {
            Some(Node::File(content)) => Ok(content.clone()),
            _ => Err(TransportError::NotFound(remote_path.to_string())),
        }
    }

    async fn external_upload(
        &self,
        _machine: &str,
        filename: &str,
        target_dir: &str,
    ) -> FacadeResult<Box<dyn UploadHandle>> {
        let mut state = self.lock();
        state.counters.external_uploads += 1;
        state.external_upload_names.push(filename.to_string());
        let target = format!("{}/{filename}", target_dir.trim_end_matches('/'));
        let url = format!("mock://staging{target}");
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), filename.to_string());
        Ok(Box::new(MockUploadHandle {
            state: self.state.clone(),
            params: UploadParameters {
                url,
                method: "POST".to_string(),
                data,
                ..Default::default()
            },
            target,
            polls_left: state.transfer_polls,
        }))
    }

    async fn external_download(
        &self,
        _machine: &str,
        remote_path: &str,
    ) -> FacadeResult<Box<dyn DownloadHandle>> {
        let mut state = self.lock();
        state.counters.external_downloads += 1;
        if !matches!(state.nodes.get(remote_path), Some(Node::File(_))) {
            return Err(TransportError::NotFound(remote_path.to_string()));
        }
        Ok(Box::new(MockDownloadHandle {
            state: self.state.clone(),
            url: format!("mock://download{remote_path}"),
            polls_left: state.transfer_polls,
            ready: false,
        }))
    }

    async fn submit(&self, _machine: &str, script_path: &str) -> FacadeResult<String> {
        let mut state = self.lock();
        state.counters.submits += 1;
        if !matches!(state.nodes.get(script_path), Some(Node::File(_))) {
            return Err(TransportError::NotFound(script_path.to_string()));
        }
        state.next_job_id += 1;
        let job_id = state.next_job_id.to_string();
        let states: VecDeque<String> = state.job_states.iter().cloned().collect();
        state.jobs.insert(job_id.clone(), states);

        // stand-in for the script running: its outputs appear in the job dir
        if let Some(job_dir) = parent_of(script_path) {
            let outputs = state.outputs_on_submit.clone();
            for (rel, node) in outputs {
                let path = format!("{job_dir}/{rel}");
                if let Some(parent) = parent_of(&path) {
                    ensure_dirs(&mut state.nodes, &parent);
                }
                state.nodes.insert(path, node);
            }
        }
        Ok(job_id)
    }

    async fn poll(&self, _machine: &str, job_ids: &[String]) -> FacadeResult<Vec<JobRecord>> {
        let mut state = self.lock();
        state.counters.polls += 1;
        let template = state.job_states.clone();
        let mut records = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let queue = state
                .jobs
                .entry(job_id.clone())
                .or_insert_with(|| template.iter().cloned().collect());
            let job_state = if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            };
            records.push(JobRecord {
                jobid: job_id.clone(),
                state: job_state,
            });
        }
        Ok(records)
    }

    async fn list_files(
        &self,
        _machine: &str,
        path: &str,
        show_hidden: bool,
    ) -> FacadeResult<Vec<LsEntry>> {
        let mut state = self.lock();
        state.counters.lists += 1;
        if !matches!(state.nodes.get(path), Some(Node::Dir)) {
            return Err(TransportError::NotFound(path.to_string()));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let entries = state
            .nodes
            .iter()
            .filter_map(|(key, node)| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    return None;
                }
                if !show_hidden && rest.starts_with('.') {
                    return None;
                }
                Some(LsEntry {
                    name: rest.to_string(),
                    file_type: node_type(node),
                    size: node_size(node),
                    link_target: match node {
                        Node::Symlink(target) => Some(target.clone()),
                        _ => None,
                    },
                })
            })
            .collect();
        Ok(entries)
    }

    async fn stat(&self, _machine: &str, path: &str) -> FacadeResult<StatRecord> {
        let mut state = self.lock();
        state.counters.stats += 1;
        match state.nodes.get(path) {
            Some(node) => Ok(StatRecord {
                size: node_size(node),
                mtime: 0,
            }),
            None => Err(TransportError::NotFound(path.to_string())),
        }
    }

    async fn checksum(&self, _machine: &str, path: &str) -> FacadeResult<String> {
        let mut state = self.lock();
        state.counters.checksums += 1;
        match state.nodes.get(path) {
            Some(Node::File(content)) => Ok(hex::encode(Sha256::digest(content))),
            _ => Err(TransportError::NotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl StagingClient for MockFacade {
    async fn post_form(
        &self,
        params: &UploadParameters,
        _filename: &str,
        content: Vec<u8>,
    ) -> FacadeResult<()> {
        let mut state = self.lock();
        state.counters.staged_posts += 1;
        state.staged.insert(params.url.clone(), content);
        Ok(())
    }

    async fn get(&self, url: &str) -> FacadeResult<Vec<u8>> {
        let mut state = self.lock();
        state.counters.staged_gets += 1;
        let path = url
            .strip_prefix("mock://download")
            .ok_or_else(|| TransportError::Protocol(format!("unexpected signed URL: {url}")))?;
        match state.nodes.get(path) {
            Some(Node::File(content)) => Ok(content.clone()),
            _ => Err(TransportError::NotFound(path.to_string())),
        }
    }
}

struct MockUploadHandle {
    state: Arc<Mutex<MockState>>,
    params: UploadParameters,
    target: String,
    polls_left: u32,
}

#[async_trait]
impl UploadHandle for MockUploadHandle {
    async fn in_progress(&mut self) -> FacadeResult<bool> {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return Ok(true);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(content) = state.staged.remove(&self.params.url) {
            if let Some(parent) = parent_of(&self.target) {
                ensure_dirs(&mut state.nodes, &parent);
            }
            state.nodes.insert(self.target.clone(), Node::File(content));
        }
        Ok(false)
    }

    fn parameters(&self) -> &UploadParameters {
        &self.params
    }

    async fn invalidate(&mut self) -> FacadeResult<()> {
        self.state.lock().unwrap().counters.invalidations += 1;
        Ok(())
    }
}

struct MockDownloadHandle {
    state: Arc<Mutex<MockState>>,
    url: String,
    polls_left: u32,
    ready: bool,
}

#[async_trait]
impl DownloadHandle for MockDownloadHandle {
    async fn in_progress(&mut self) -> FacadeResult<bool> {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return Ok(true);
        }
        self.ready = true;
        Ok(false)
    }

    fn url(&self) -> FacadeResult<String> {
        if !self.ready {
            return Err(TransportError::Protocol(
                "download URL requested before the transfer settled".to_string(),
            ));
        }
        Ok(self.url.clone())
    }

    async fn invalidate(&mut self) -> FacadeResult<()> {
        self.state.lock().unwrap().counters.invalidations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_requires_the_script_and_assigns_increasing_ids() {
        let mock = MockFacade::new();
        assert!(mock.submit("m", "/work/job.sh").await.is_err());

        mock.put_file("/work/job.sh", b"#!/bin/bash");
        let first = mock.submit("m", "/work/job.sh").await.unwrap();
        let second = mock.submit("m", "/work/job.sh").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn poll_walks_the_state_sequence() {
        let mock = MockFacade::new();
        mock.set_job_states(&["PENDING", "RUNNING", "COMPLETED"]);
        mock.put_file("/work/job.sh", b"x");
        let job = mock.submit("m", "/work/job.sh").await.unwrap();

        let ids = vec![job.clone()];
        assert_eq!(mock.poll("m", &ids).await.unwrap()[0].state, "PENDING");
        assert_eq!(mock.poll("m", &ids).await.unwrap()[0].state, "RUNNING");
        assert_eq!(mock.poll("m", &ids).await.unwrap()[0].state, "COMPLETED");
        // last state repeats
        assert_eq!(mock.poll("m", &ids).await.unwrap()[0].state, "COMPLETED");
    }

    #[tokio::test]
    async fn unknown_jobs_get_the_template_sequence() {
        let mock = MockFacade::new();
        mock.set_job_states(&["COMPLETED"]);
        let records = mock.poll("m", &["42".to_string()]).await.unwrap();
        assert_eq!(records[0].state, "COMPLETED");
    }

    #[tokio::test]
    async fn staged_upload_settles_after_polls() {
        let mock = MockFacade::new();
        mock.put_dir("/work");
        mock.set_transfer_polls(2);

        let mut handle = mock.external_upload("m", "big.bin", "/work").await.unwrap();
        let params = handle.parameters().clone();
        StagingClient::post_form(&mock, &params, "big.bin", vec![1, 2, 3])
            .await
            .unwrap();

        assert!(handle.in_progress().await.unwrap());
        assert!(handle.in_progress().await.unwrap());
        assert!(!handle.in_progress().await.unwrap());
        assert_eq!(mock.file("/work/big.bin").unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn download_url_is_gated_on_readiness() {
        let mock = MockFacade::new();
        mock.put_file("/work/out.bin", b"abc");
        let mut handle = mock.external_download("m", "/work/out.bin").await.unwrap();
        assert!(handle.url().is_err());
        assert!(handle.in_progress().await.unwrap());
        assert!(!handle.in_progress().await.unwrap());
        let url = handle.url().unwrap();
        assert_eq!(StagingClient::get(&mock, &url).await.unwrap(), b"abc");
    }
}
