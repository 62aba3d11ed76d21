// SPDX-License-Identifier: AGPL-3.0-only

//! Job lifecycle: stage the input, run the worker, fetch the result, clean up.
//!
//! A job moves through `Created -> Parameterized -> Staging -> Executing ->
//! Fetching -> Ready | Cancelled | Failed -> CleanedUp`. Cleanup runs exactly
//! once for every started job, removes staged artifacts files-first then
//! directories in reverse creation order, logs failures without overriding the
//! decided outcome, and releases the session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::{JobError, JobResult};
use crate::exec::{self, CommandSpec, ExecutionContext, LineParser, NullParser, RunnerOptions, UnitProgressParser};
use crate::progress::{ProgressSink, ScaledSink, TaskStatus, WatchSink};
use crate::ssh::{Credential, SessionCache, SessionLease, SessionManager, SshParams};
use crate::transfer::{self, TransferOptions};
use crate::util::{random_suffix, remote_join};

mod registry;
pub use registry::JobRegistry;

// overall-progress slices per stage
const STAGE_SPAN: (i64, i64) = (0, 10);
const EXECUTE_SPAN: (i64, i64) = (10, 90);
const FETCH_SPAN: (i64, i64) = (90, 100);

/// Argument placeholders replaced with the staged input and output paths.
pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Parameterized,
    Staging,
    Executing,
    Fetching,
    Ready,
    Cancelled,
    Failed,
    CleanedUp,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::Parameterized => "parameterized",
            JobState::Staging => "staging",
            JobState::Executing => "executing",
            JobState::Fetching => "fetching",
            JobState::Ready => "ready",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
            JobState::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// The decided end of a job, recorded before cleanup starts so observers see
/// it even though the state machine finishes in `CleanedUp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ready,
    Cancelled,
    Failed(JobError),
}

/// Everything a job needs to run one worker invocation.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub job_id: String,
    /// Worker argv; `{input}` and `{output}` expand to the staged paths.
    pub argv: Vec<String>,
    pub local_input: PathBuf,
    pub local_output: PathBuf,
    /// Base directory for per-job staging namespaces.
    pub remote_workdir: String,
    pub input_name: String,
    pub output_name: String,
    /// `None` runs the worker on the local host.
    pub ssh: Option<SshParams>,
    /// Stdout marker announcing `<current>/<total>` progress, if the worker
    /// emits one.
    pub progress_marker: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub poll_interval: Duration,
    pub grace_window: Duration,
    pub chunk_size: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        let runner = RunnerOptions::default();
        Self {
            poll_interval: runner.poll_interval,
            grace_window: runner.grace_window,
            chunk_size: TransferOptions::default().chunk_size,
        }
    }
}

pub struct Job {
    opts: JobOptions,
    params: StdMutex<Option<JobParams>>,
    state_tx: watch::Sender<JobState>,
    status_tx: watch::Sender<TaskStatus>,
    cancel: Arc<AtomicBool>,
    started: AtomicBool,
    outcome: StdMutex<Option<JobOutcome>>,
}

impl Default for Job {
    fn default() -> Self {
        Self::new(JobOptions::default())
    }
}

impl Job {
    pub fn new(opts: JobOptions) -> Self {
        let (state_tx, _) = watch::channel(JobState::Created);
        let (status_tx, _) = watch::channel(TaskStatus::default());
        Self {
            opts,
            params: StdMutex::new(None),
            state_tx,
            status_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            outcome: StdMutex::new(None),
        }
    }

    /// Validate and store parameters, moving `Created -> Parameterized`.
    /// The first violated precondition is reported.
    pub fn configure(&self, params: JobParams) -> JobResult<()> {
        if self.state() != JobState::Created {
            return Err(JobError::Configuration(
                "job is already parameterized".into(),
            ));
        }
        validate(&params)?;
        log::info!("job {} parameterized", params.job_id);
        *self.params.lock().unwrap() = Some(params);
        self.set_state(JobState::Parameterized);
        Ok(())
    }

    pub fn id(&self) -> Option<String> {
        self.params.lock().unwrap().as_ref().map(|p| p.job_id.clone())
    }

    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    pub fn status(&self) -> TaskStatus {
        self.status_tx.borrow().clone()
    }

    /// Decided outcome, available once the job has gone terminal.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.lock().unwrap().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == JobState::CleanedUp
    }

    /// Launch the pipeline task. A job starts at most once; remote jobs lease
    /// their session from `sessions` when given one, otherwise each job opens
    /// a dedicated connection.
    pub fn start(
        self: &Arc<Self>,
        sessions: Option<Arc<SessionCache>>,
    ) -> JobResult<()> {
        let params = {
            let guard = self.params.lock().unwrap();
            guard
                .clone()
                .ok_or_else(|| JobError::Configuration("job is not parameterized".into()))?
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("job was already started".into()));
        }
        let job = self.clone();
        tokio::spawn(async move {
            job.pipeline(params, sessions).await;
        });
        Ok(())
    }

    /// Request cancellation. Idempotent; a job that never started goes
    /// terminal immediately.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if !self.started.swap(true, Ordering::SeqCst) {
            log::info!("job cancelled before start");
            *self.outcome.lock().unwrap() = Some(JobOutcome::Cancelled);
            self.set_state(JobState::Cancelled);
            self.set_state(JobState::CleanedUp);
        }
    }

    /// Wait until cleanup has finished and the job is in its final state.
    pub async fn wait_terminal(&self) {
        let mut rx = self.state_tx.subscribe();
        while *rx.borrow_and_update() != JobState::CleanedUp {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_state(&self, state: JobState) {
        log::debug!("job state -> {state}");
        self.state_tx.send_replace(state);
    }

    async fn pipeline(self: Arc<Self>, params: JobParams, sessions: Option<Arc<SessionCache>>) {
        let sink = WatchSink::new(self.status_tx.clone(), self.cancel.clone());
        let mut created_files: Vec<String> = Vec::new();
        let mut created_dirs: Vec<String> = Vec::new();
        let mut ctx: Option<ExecutionContext> = None;
        let mut lease: Option<SessionLease> = None;
        let dedicated_session = sessions.is_none() && params.ssh.is_some();

        let result = self
            .run_stages(
                &params,
                sessions,
                &sink,
                &mut ctx,
                &mut lease,
                &mut created_files,
                &mut created_dirs,
            )
            .await;

        let outcome = match result {
            Ok(()) => JobOutcome::Ready,
            Err(JobError::Cancelled) => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(err),
        };
        match &outcome {
            JobOutcome::Ready => log::info!("job {} finished", params.job_id),
            JobOutcome::Cancelled => log::info!("job {} cancelled", params.job_id),
            JobOutcome::Failed(err) => log::error!("job {} failed: {err}", params.job_id),
        }
        *self.outcome.lock().unwrap() = Some(outcome.clone());
        self.set_state(match outcome {
            JobOutcome::Ready => JobState::Ready,
            JobOutcome::Cancelled => JobState::Cancelled,
            JobOutcome::Failed(_) => JobState::Failed,
        });

        cleanup(&ctx, &created_files, &created_dirs, dedicated_session).await;
        // the lease is held through cleanup; the session frees up only here
        drop(lease);
        self.set_state(JobState::CleanedUp);
    }

    async fn run_stages(
        &self,
        params: &JobParams,
        sessions: Option<Arc<SessionCache>>,
        sink: &dyn ProgressSink,
        ctx_out: &mut Option<ExecutionContext>,
        lease_out: &mut Option<SessionLease>,
        created_files: &mut Vec<String>,
        created_dirs: &mut Vec<String>,
    ) -> JobResult<()> {
        self.set_state(JobState::Staging);
        let ctx = match (&params.ssh, sessions) {
            (Some(ssh), Some(cache)) => {
                let lease = cache.lease(ssh.clone()).await?;
                let ctx = ExecutionContext::Remote(lease.session().clone());
                *lease_out = Some(lease);
                ctx
            }
            (Some(ssh), None) => {
                let session = Arc::new(SessionManager::new(ssh.clone()));
                session.connect().await?;
                ExecutionContext::Remote(session)
            }
            (None, _) => ExecutionContext::Local,
        };
        *ctx_out = Some(ctx.clone());

        // per-job namespace so concurrent jobs never share staging paths
        let staging_dir = remote_join(
            &params.remote_workdir,
            &format!("{}-{}", params.job_id, random_suffix(8)),
        );
        let remote_input = remote_join(&staging_dir, &params.input_name);
        let remote_output = remote_join(&staging_dir, &params.output_name);
        let transfer_opts = TransferOptions {
            chunk_size: self.opts.chunk_size,
        };

        let stage_sink = ScaledSink::new(sink, STAGE_SPAN.0, STAGE_SPAN.1);
        stage_sink.report("Staging input", 0, 0);
        let dirs = transfer::upload(
            &ctx,
            &params.local_input,
            &remote_input,
            &stage_sink,
            &transfer_opts,
        )
        .await?;
        created_dirs.extend(dirs);
        created_files.push(remote_input.clone());
        // registered up front so a failed run still gets its partial output
        // scrubbed by cleanup
        created_files.push(remote_output.clone());

        if sink.interrupted() {
            return Err(JobError::Cancelled);
        }

        self.set_state(JobState::Executing);
        let argv = substitute_argv(&params.argv, &remote_input, &remote_output);
        let mut parser: Box<dyn LineParser> = match &params.progress_marker {
            Some(marker) => Box::new(UnitProgressParser::new(marker.clone(), "Processing")),
            None => Box::new(NullParser),
        };
        let exec_sink = ScaledSink::new(sink, EXECUTE_SPAN.0, EXECUTE_SPAN.1);
        exec_sink.report("Processing", 0, 0);
        let runner_opts = RunnerOptions {
            poll_interval: self.opts.poll_interval,
            grace_window: self.opts.grace_window,
        };
        exec::run(
            &ctx,
            &CommandSpec::new(argv),
            parser.as_mut(),
            &exec_sink,
            &runner_opts,
        )
        .await?;

        if sink.interrupted() {
            return Err(JobError::Cancelled);
        }

        self.set_state(JobState::Fetching);
        let fetch_sink = ScaledSink::new(sink, FETCH_SPAN.0, FETCH_SPAN.1);
        fetch_sink.report("Retrieving result", 0, 0);
        transfer::download(
            &ctx,
            &remote_output,
            &params.local_output,
            &fetch_sink,
            &transfer_opts,
        )
        .await?;

        sink.report("Ready", 100, 100);
        Ok(())
    }
}

fn validate(params: &JobParams) -> JobResult<()> {
    if params.job_id.trim().is_empty() {
        return Err(JobError::Configuration("job id is empty".into()));
    }
    if params.argv.is_empty() {
        return Err(JobError::Configuration("worker command is empty".into()));
    }
    // remote executables cannot be probed before a connection exists; for
    // those, reachability surfaces at connect/exec time
    if params.ssh.is_none() && !local_executable_exists(&params.argv[0]) {
        return Err(JobError::Configuration(format!(
            "worker executable not found: {}",
            params.argv[0]
        )));
    }
    if let Some(ssh) = &params.ssh {
        if let Credential::KeyFile(path) = &ssh.credential {
            if !path.is_file() {
                return Err(JobError::Configuration(format!(
                    "private key file not found: {}",
                    path.display()
                )));
            }
        }
    }
    if !params.local_input.is_file() {
        return Err(JobError::Configuration(format!(
            "local input file not found: {}",
            params.local_input.display()
        )));
    }
    if params.local_output.as_os_str().is_empty() {
        return Err(JobError::Configuration("local output path is empty".into()));
    }
    if params.remote_workdir.trim().is_empty() {
        return Err(JobError::Configuration("workdir is empty".into()));
    }
    for (field, value) in [
        ("input name", &params.input_name),
        ("output name", &params.output_name),
    ] {
        if value.trim().is_empty() || value.contains('/') {
            return Err(JobError::Configuration(format!(
                "{field} must be a bare file name, got {value:?}"
            )));
        }
    }
    Ok(())
}

/// Cheap existence probe for the worker binary: an explicit path must be a
/// file, a bare name must resolve through `PATH`.
fn local_executable_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    match std::env::var_os("PATH") {
        Some(paths) => std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()),
        None => false,
    }
}

fn substitute_argv(argv: &[String], input: &str, output: &str) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            arg.replace(INPUT_PLACEHOLDER, input)
                .replace(OUTPUT_PLACEHOLDER, output)
        })
        .collect()
}

/// Remove staged files, then created directories leaf-first, each failure
/// logged and skipped. Dedicated sessions are shut down afterwards; leased
/// ones stay with their cache.
async fn cleanup(
    ctx: &Option<ExecutionContext>,
    created_files: &[String],
    created_dirs: &[String],
    dedicated_session: bool,
) {
    let Some(ctx) = ctx else {
        return;
    };
    for file in created_files.iter().rev() {
        if let Err(err) = transfer::remove_file(ctx, file).await {
            log::warn!("cleanup: could not remove {file}: {err}");
        }
    }
    for dir in created_dirs {
        if let Err(err) = transfer::remove_folder(ctx, dir).await {
            log::warn!("cleanup: could not remove {dir}: {err}");
        }
    }
    if dedicated_session {
        if let ExecutionContext::Remote(session) = ctx {
            session.shutdown().await;
        }
    }
}
