// SPDX-License-Identifier: AGPL-3.0-only

//! Stagehand runs one-shot worker jobs on a remote host over SSH, or locally,
//! with the same contract either way: stage the input file, execute the
//! worker while streaming its progress, fetch the result, and clean the
//! staging area up again.
//!
//! The entry points are [`job::Job`] for a single pipeline and
//! [`job::JobRegistry`] for tracking many of them. Remote jobs share SSH
//! connections through a [`ssh::SessionCache`].

pub mod config;
pub mod errors;
pub mod exec;
pub mod job;
pub mod logging;
pub mod progress;
pub mod ssh;
pub mod transfer;
pub(crate) mod util;

pub use errors::{JobError, JobResult};
pub use exec::{CommandSpec, ExecutionContext, LineParser, NullParser, UnitProgressParser};
pub use job::{Job, JobOptions, JobOutcome, JobParams, JobRegistry, JobState};
pub use progress::{NullSink, ProgressSink, TaskStatus};
pub use ssh::{Credential, SessionCache, SessionLease, SessionManager, SshParams};
pub use transfer::TransferOptions;
