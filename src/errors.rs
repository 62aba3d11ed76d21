// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error as ThisError;

/// Stable string codes for surfacing errors across API boundaries.
pub mod codes {
    pub const CONFIGURATION_ERROR: &str = "configuration_error";
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const TRANSFER_ERROR: &str = "transfer_error";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const CANCELED: &str = "canceled";
}

/// Everything that can abort a job. Cleanup failures are deliberately absent:
/// they are logged where they happen and never override the decided outcome.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication or connection failure: {0}")]
    Auth(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("worker exited with code {code}: {stderr}")]
    Execution { code: i32, stderr: String },

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => codes::CONFIGURATION_ERROR,
            JobError::Auth(_) => codes::AUTHENTICATION_FAILURE,
            JobError::Transfer(_) => codes::TRANSFER_ERROR,
            JobError::Execution { .. } => codes::EXECUTION_ERROR,
            JobError::Cancelled => codes::CANCELED,
        }
    }

    /// Wrap an adapter-layer error as a transfer failure, keeping the chain.
    pub fn transfer(err: impl std::fmt::Display) -> Self {
        JobError::Transfer(err.to_string())
    }

    pub fn auth(err: impl std::fmt::Display) -> Self {
        JobError::Auth(err.to_string())
    }
}

pub type JobResult<T> = Result<T, JobError>;
