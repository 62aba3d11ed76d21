// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;
use tokio::time::Instant;

use crate::errors::{JobError, JobResult};
use crate::progress::ProgressSink;

use super::parser::LineParser;
use super::process::{LocalProcess, ProcessEvent, ProcessHandle, TryEvent};
use super::{CommandSpec, ExecutionContext};

/// Poll loop tuning. The grace window bounds how long a cancelled process may
/// take between the terminate signal and the forceful kill.
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub poll_interval: Duration,
    pub grace_window: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            grace_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub code: i32,
}

/// Splits a byte stream into complete lines, holding back the unterminated
/// tail. Both `\n` and `\r` end a line so carriage-return progress updates
/// are seen as they happen.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

struct RunState<'a> {
    parser: &'a mut dyn LineParser,
    sink: &'a dyn ProgressSink,
    out_lines: LineBuffer,
    stderr: String,
    exit_code: Option<i32>,
}

impl RunState<'_> {
    fn consume(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(bytes) => {
                for line in self.out_lines.push(&bytes) {
                    self.parser.parse_line(&line, self.sink);
                }
            }
            // stderr is always drained so the child cannot stall on a full
            // pipe; it only ever feeds the error buffer
            ProcessEvent::Stderr(bytes) => {
                self.stderr.push_str(&String::from_utf8_lossy(&bytes));
            }
            ProcessEvent::Exited(code) => self.exit_code = Some(code),
        }
    }

    /// Drain everything currently buffered. Returns true once the handle is
    /// closed and nothing more will arrive.
    fn drain(&mut self, handle: &mut dyn ProcessHandle) -> bool {
        loop {
            match handle.try_event() {
                TryEvent::Event(event) => self.consume(event),
                TryEvent::Empty => return false,
                TryEvent::Closed => return true,
            }
        }
    }

    fn finish_lines(&mut self) {
        if let Some(line) = self.out_lines.flush() {
            self.parser.parse_line(&line, self.sink);
        }
    }
}

/// Run `command` to completion in `ctx`, feeding stdout lines to `parser`.
///
/// STARTING -> RUNNING -> EXITED(code), or on an interrupt observed during the
/// poll loop, CANCELLING -> (graceful exit | KILLED). Exit code 0 is success;
/// any other exit surfaces the accumulated stderr.
pub async fn run(
    ctx: &ExecutionContext,
    command: &CommandSpec,
    parser: &mut dyn LineParser,
    sink: &dyn ProgressSink,
    opts: &RunnerOptions,
) -> JobResult<ExitResult> {
    let handle: Box<dyn ProcessHandle> = match ctx {
        ExecutionContext::Local => Box::new(
            LocalProcess::spawn(&command.argv).map_err(|e| spawn_error(&e))?,
        ),
        ExecutionContext::Remote(session) => Box::new(
            session
                .spawn_command(&command.shell_line())
                .await
                .map_err(|e| spawn_error(&e))?,
        ),
    };
    run_with_handle(handle, parser, sink, opts).await
}

fn spawn_error(err: &anyhow::Error) -> JobError {
    JobError::Execution {
        code: -1,
        stderr: format!("{err:#}"),
    }
}

pub(crate) async fn run_with_handle(
    mut handle: Box<dyn ProcessHandle>,
    parser: &mut dyn LineParser,
    sink: &dyn ProgressSink,
    opts: &RunnerOptions,
) -> JobResult<ExitResult> {
    let mut state = RunState {
        parser,
        sink,
        out_lines: LineBuffer::default(),
        stderr: String::new(),
        exit_code: None,
    };

    let mut ticker = tokio::time::interval(opts.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let closed = loop {
        ticker.tick().await;
        if state.drain(handle.as_mut()) {
            break true;
        }
        if sink.interrupted() {
            break false;
        }
    };

    if !closed && state.exit_code.is_none() {
        cancel_process(handle.as_mut(), &mut state, opts).await;
        handle.disconnect().await;
        return Err(JobError::Cancelled);
    }
    if !closed {
        // exit status already observed; pick up any remaining buffered output
        state.drain(handle.as_mut());
    }

    state.finish_lines();
    handle.disconnect().await;

    match state.exit_code {
        Some(0) => Ok(ExitResult { code: 0 }),
        Some(code) => Err(JobError::Execution {
            code,
            stderr: state.stderr.trim().to_string(),
        }),
        None => Err(JobError::Execution {
            code: -1,
            stderr: if state.stderr.trim().is_empty() {
                "worker ended without reporting an exit status".to_string()
            } else {
                state.stderr.trim().to_string()
            },
        }),
    }
}

/// Escalating stop: terminate, poll for exit through the grace window, then
/// kill exactly once and wait for the handle to wind down.
async fn cancel_process(
    handle: &mut dyn ProcessHandle,
    state: &mut RunState<'_>,
    opts: &RunnerOptions,
) {
    log::info!("cancellation observed, sending terminate signal");
    if let Err(e) = handle.terminate().await {
        log::warn!("terminate signal failed: {e:#}");
    }

    let mut deadline = Instant::now() + opts.grace_window;
    let mut killed = false;
    loop {
        tokio::time::sleep(opts.poll_interval).await;
        if state.drain(handle) {
            break;
        }
        if state.exit_code.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            if killed {
                log::warn!("process still alive after kill, giving up on the handle");
                break;
            }
            log::warn!("grace window elapsed, sending kill signal");
            if let Err(e) = handle.kill().await {
                log::warn!("kill signal failed: {e:#}");
            }
            killed = true;
            deadline = Instant::now() + opts.grace_window;
        }
    }
    if killed {
        log::info!("worker stopped after kill");
    } else {
        log::info!("worker stopped within the grace window");
    }
}
