//! Driving calcjobs through their step machine.
//!
//! Each playing process gets one task that advances
//! created -> uploading -> submitting -> running -> retrieving -> finalised,
//! writing the row back after every transition. A failing step flips the
//! job to `excepted` with the failure recorded, leaving the step pointing at
//! the phase that failed; a restart therefore resumes exactly where the
//! previous run stopped, and a job that reached `running` is never
//! re-submitted.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use restflow_store::{
    CalcJob, Client, Code, DataNode, Filter, Process, State, Step, Storage, StoreError,
    UploadPaths,
};
use restflow_transport::{
    glob, FacadeClient, FileType, HttpFacade, HttpStagingClient, PollConfig, Poller,
    StagingClient, Transport,
};
use tokio::task::JoinSet;

use crate::script::render_script;
use crate::{EngineError, StepError};

/// Fixed name of the rendered batch script inside the job directory.
///
/// Retrieval skips it: it can always be re-rendered from the code row.
pub const SCRIPT_FILENAME: &str = "job.sh";

/// Environment flag enabling the signed-URL workarounds for facade test
/// deployments. Read once when the runner is built.
pub const LOCAL_TESTING_ENV: &str = "RESTFLOW_LOCAL_TESTING";

/// Polling cadences for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Scheduler polling while a job is `running`.
    pub job_poll: PollConfig,
    /// Staged-transfer polling inside uploads and downloads.
    pub transfer_poll: PollConfig,
}

/// Builds the facade and staging clients for one stored client row.
pub type FacadeFactory = dyn Fn(&Client) -> Result<(Arc<dyn FacadeClient>, Arc<dyn StagingClient>), EngineError>
    + Send
    + Sync;

struct RunnerInner {
    storage: Storage,
    options: RunOptions,
    factory: Box<FacadeFactory>,
    /// One transport per client row, shared across that client's jobs.
    transports: Mutex<HashMap<i64, Arc<Transport>>>,
}

/// The concurrent driver: picks up playing processes and advances each in
/// its own task.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(storage: Storage) -> Self {
        let local_testing = std::env::var_os(LOCAL_TESTING_ENV).is_some();
        Self::with_factory(
            storage,
            Box::new(move |client: &Client| {
                let facade = HttpFacade::new(
                    &client.client_url,
                    &client.client_id,
                    &client.client_secret,
                    &client.token_uri,
                )?;
                Ok((
                    Arc::new(facade) as Arc<dyn FacadeClient>,
                    Arc::new(HttpStagingClient::new(local_testing)) as Arc<dyn StagingClient>,
                ))
            }),
        )
    }

    /// A runner with a caller-supplied facade, e.g. the mock for tests.
    pub fn with_factory(storage: Storage, factory: Box<FacadeFactory>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                storage,
                options: RunOptions::default(),
                factory,
                transports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configured before tasks are spawned")
            .options = options;
        self
    }

    fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    fn transport_for(&self, client: &Client) -> Result<Arc<Transport>, EngineError> {
        let pk = client.pk.expect("stored client row has a pk");
        let mut cache = self.inner.transports.lock().unwrap();
        if let Some(transport) = cache.get(&pk) {
            return Ok(transport.clone());
        }
        let (facade, staging) = (self.inner.factory)(client)?;
        let transport = Arc::new(Transport::new(
            facade,
            staging,
            client.machine_name.clone(),
            client.fsystem.separator(),
            client.small_file_limit_bytes(),
            self.inner.options.transfer_poll,
        ));
        cache.insert(pk, transport.clone());
        Ok(transport)
    }

    /// Run every process currently in the `playing` state, at most `limit`
    /// of them, each as its own task. Excepted and finished jobs are left
    /// alone, so a second invocation over a settled set is a no-op.
    pub async fn run_unfinished(&self, limit: Option<usize>) -> Result<(), EngineError> {
        let playing: Vec<Process> =
            self.storage()
                .iter_rows(1, limit, &[Filter::eq("state", "playing")])?;
        tracing::info!(count = playing.len(), "running unfinished calcjobs");

        let mut tasks = JoinSet::new();
        for process in playing {
            let runner = self.clone();
            tasks.spawn(async move { runner.run_one(process).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(err) => tracing::error!(error = %err, "calcjob task died"),
            }
        }
        Ok(())
    }

    /// Advance one process until finalised or excepted.
    ///
    /// Only infrastructure failures (the storage write-back itself) are
    /// returned; step failures are recorded on the row.
    pub async fn run_one(&self, mut process: Process) -> Result<(), EngineError> {
        let pk = process.pk.expect("stored process row has a pk");
        while process.step != Step::Finalised {
            match self.run_step(&mut process).await {
                Ok(()) => {
                    self.storage().update_row(&process)?;
                    tokio::task::yield_now().await;
                }
                Err(err) => {
                    tracing::error!(pk, error = %err, "error running calcjob");
                    process.state = State::Excepted;
                    process.exception = Some(err.persisted());
                    self.storage().update_row(&process)?;
                    return Ok(());
                }
            }
        }
        process.state = State::Finished;
        self.storage().update_row(&process)?;
        tracing::info!(pk, "calcjob finished");
        Ok(())
    }

    async fn run_step(&self, process: &mut Process) -> Result<(), StepError> {
        if process.step == Step::Created {
            process.step = Step::Uploading;
        }
        match process.step {
            Step::Uploading => {
                self.copy_to_remote(process).await?;
                process.step = Step::Submitting;
            }
            Step::Submitting => {
                self.submit_on_remote(process).await?;
                process.step = Step::Running;
            }
            Step::Running => {
                self.poll_until_finished(process).await?;
                process.step = Step::Retrieving;
            }
            Step::Retrieving => {
                self.copy_from_remote(process).await?;
                process.step = Step::Finalised;
            }
            Step::Created | Step::Finalised => unreachable!("handled by the caller"),
        }
        Ok(())
    }

    fn job_context(&self, process: &Process) -> Result<JobContext, StepError> {
        let calc: CalcJob = self.storage().get_row(process.calcjob_pk)?;
        let code: Code = self.storage().get_row(calc.code_pk)?;
        let client: Client = self.storage().get_row(code.client_pk)?;
        let transport = self.transport_for(&client).map_err(|err| match err {
            EngineError::Store(e) => StepError::Store(e),
            EngineError::Transport(e) => StepError::Transport(e),
        })?;
        let remote_dir = calc.remote_dir(&client);
        Ok(JobContext {
            calc,
            code,
            client,
            transport,
            remote_dir,
        })
    }

    /// Copy the calculation inputs to the compute resource.
    ///
    /// The script goes first; then directories and files from the code's
    /// map, then the calcjob's, so job-specific files shadow code files.
    async fn copy_to_remote(&self, process: &Process) -> Result<(), StepError> {
        let ctx = self.job_context(process)?;
        let pk = process.pk.unwrap_or_default();
        tracing::info!(pk, remote_dir = %ctx.remote_dir, "uploading files to remote");
        let sep = ctx.transport.separator();

        ctx.transport.mkdir(&ctx.remote_dir, true).await?;

        let script = render_script(&ctx.calc, &ctx.code, &ctx.client)?;
        ctx.transport
            .upload_bytes(&ctx.remote_dir, SCRIPT_FILENAME, script.as_bytes())
            .await?;
        tokio::task::yield_now().await;

        for (rel_path, key) in ctx.code.upload_paths.iter().chain(ctx.calc.upload_paths.iter()) {
            let parts: Vec<&str> = rel_path.split('/').filter(|p| !p.is_empty()).collect();
            match key {
                None => {
                    let dir = join_remote(&ctx.remote_dir, sep, &parts);
                    ctx.transport.mkdir(&dir, true).await?;
                }
                Some(key) => {
                    let (dirs, filename) = parts
                        .split_last()
                        .map(|(name, dirs)| (dirs, *name))
                        .ok_or_else(|| {
                            StepError::Store(StoreError::Validation(format!(
                                "empty upload path for key {key}"
                            )))
                        })?;
                    let parent = join_remote(&ctx.remote_dir, sep, dirs);
                    if parent != ctx.remote_dir {
                        ctx.transport.mkdir(&parent, true).await?;
                    }
                    let mut content = Vec::new();
                    self.storage()
                        .objects()
                        .open_read(key)?
                        .read_to_end(&mut content)
                        .map_err(StoreError::Io)?;
                    ctx.transport.upload(&parent, filename, content).await?;
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }

    /// Submit the rendered script, recording the scheduler's job id.
    async fn submit_on_remote(&self, process: &mut Process) -> Result<(), StepError> {
        let ctx = self.job_context(process)?;
        let pk = process.pk.unwrap_or_default();
        tracing::info!(pk, "submitting on remote");
        let script_path = join_remote(&ctx.remote_dir, ctx.transport.separator(), &[SCRIPT_FILENAME]);
        let job_id = ctx.transport.submit(&script_path).await?;
        process.job_id = Some(job_id);
        Ok(())
    }

    /// Poll the scheduler until the job reports COMPLETED.
    async fn poll_until_finished(&self, process: &Process) -> Result<(), StepError> {
        let ctx = self.job_context(process)?;
        let pk = process.pk.unwrap_or_default();
        tracing::info!(pk, "polling job until finished");
        let job_id = process.job_id.clone().ok_or(StepError::MissingJobId)?;
        let job_ids = vec![job_id];
        let mut poller = Poller::new("job to finish", self.inner.options.job_poll);
        loop {
            let records = ctx.transport.poll(&job_ids).await?;
            if records.first().is_some_and(|r| r.state == "COMPLETED") {
                return Ok(());
            }
            poller.tick().await?;
        }
    }

    /// Retrieve the outputs selected by the calcjob's download globs.
    ///
    /// Regular files are checksummed first and only downloaded when absent
    /// from the object store; directories are recorded with no key;
    /// symlinks are skipped.
    async fn copy_from_remote(&self, process: &mut Process) -> Result<(), StepError> {
        let ctx = self.job_context(process)?;
        let pk = process.pk.unwrap_or_default();
        tracing::info!(pk, "downloading files from remote");
        let objects = self.storage().objects();
        let root = ctx.transport.dir_path(&ctx.remote_dir);

        let mut paths = UploadPaths::new();
        for pattern in &ctx.calc.download_globs {
            for mut node in glob(&root, pattern).await? {
                let Some(save_path) = node.relative_posix(&ctx.remote_dir) else {
                    continue;
                };
                if save_path == SCRIPT_FILENAME {
                    continue;
                }
                match node.known_type() {
                    Some(FileType::Symlink) => continue,
                    Some(FileType::Directory) => {
                        paths.insert(save_path, None);
                    }
                    Some(FileType::Regular) => {
                        let checksum = ctx.transport.checksum(node.path()).await?;
                        if objects.contains(&checksum) {
                            paths.insert(save_path, Some(checksum));
                            continue;
                        }
                        let size = node.size().await?.unwrap_or(0);
                        let content = ctx.transport.download(node.path(), size).await?;
                        let key = objects.add_from_bytes(&content)?;
                        if key != checksum {
                            return Err(StepError::ChecksumMismatch { path: save_path });
                        }
                        paths.insert(save_path, Some(key));
                        tokio::task::yield_now().await;
                    }
                    // sockets, pipes and devices are not retrievable
                    _ => continue,
                }
            }
        }

        let mut node = DataNode {
            pk: None,
            creator_pk: ctx.calc.pk.expect("stored calcjob row has a pk"),
            attributes: [(
                "paths".to_string(),
                serde_json::Value::from(paths.keys().cloned().collect::<Vec<_>>()),
            )]
            .into_iter()
            .collect(),
        };
        self.storage().save_row(&mut node)?;

        process.retrieved_paths = paths;
        Ok(())
    }
}

struct JobContext {
    calc: CalcJob,
    code: Code,
    client: Client,
    transport: Arc<Transport>,
    remote_dir: String,
}

fn join_remote(base: &str, sep: char, parts: &[&str]) -> String {
    let mut out = base.trim_end_matches(sep).to_string();
    for part in parts {
        out.push(sep);
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_handles_nested_parts() {
        assert_eq!(join_remote("/w/f/u", '/', &["a", "b.txt"]), "/w/f/u/a/b.txt");
        assert_eq!(join_remote("/w/f/u/", '/', &[]), "/w/f/u");
        assert_eq!(join_remote(r"C:\w", '\\', &["x"]), r"C:\w\x");
    }
}
