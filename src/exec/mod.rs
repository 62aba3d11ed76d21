// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use crate::ssh::SessionManager;
use crate::util::sh_escape;

mod parser;
pub(crate) mod process;
mod runner;

pub use parser::{LineParser, NullParser, UnitProgressParser};
pub use process::{LocalProcess, ProcessEvent, ProcessHandle, TryEvent};
pub use runner::{ExitResult, RunnerOptions, run};

/// Where a command runs. Job logic is written once against this and never
/// branches on transport.
#[derive(Clone)]
pub enum ExecutionContext {
    Local,
    Remote(Arc<SessionManager>),
}

impl ExecutionContext {
    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutionContext::Remote(_))
    }
}

/// A worker invocation as an argument vector. Local execution spawns it
/// directly; remote execution sends one shell line with quoted arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub(crate) fn shell_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| sh_escape(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
