// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{JobError, JobResult};

use super::Job;

/// Concurrency-safe index of known jobs by id.
///
/// Removing a live job is safe: it is cancelled and awaited to its final
/// state before the handle is handed back.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameterized job under its id.
    pub async fn add(&self, job: Arc<Job>) -> JobResult<()> {
        let id = job
            .id()
            .ok_or_else(|| JobError::Configuration("job is not parameterized".into()))?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(JobError::Configuration(format!(
                "a job with id {id:?} is already registered"
            )));
        }
        jobs.insert(id, job);
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// Request cancellation of a registered job. Returns false for unknown
    /// ids.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.find(id).await {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Unregister a job. A job that is still running is cancelled first and
    /// awaited until cleanup has finished.
    pub async fn remove(&self, id: &str) -> Option<Arc<Job>> {
        let job = self.jobs.write().await.remove(id)?;
        if !job.is_terminal() {
            log::info!("removing live job {id}, cancelling first");
            job.cancel();
            job.wait_terminal().await;
        }
        Some(job)
    }

    /// Cancel everything and wait for all cleanups. Used on shutdown.
    pub async fn drain(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.write().await.drain().map(|(_, j)| j).collect();
        for job in &jobs {
            job.cancel();
        }
        for job in jobs {
            job.wait_terminal().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobOutcome, JobParams, JobState};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_opts() -> JobOptions {
        JobOptions {
            poll_interval: Duration::from_millis(5),
            grace_window: Duration::from_millis(200),
            chunk_size: 4096,
        }
    }

    async fn configured_job(root: &Path, id: &str, argv: Vec<String>) -> Arc<Job> {
        tokio::fs::write(root.join("input.bin"), b"payload")
            .await
            .unwrap();
        let job = Arc::new(Job::new(fast_opts()));
        job.configure(JobParams {
            job_id: id.to_string(),
            argv,
            local_input: root.join("input.bin"),
            local_output: root.join("output.bin"),
            remote_workdir: root.join("work").to_str().unwrap().to_string(),
            input_name: "in.bin".into(),
            output_name: "out.bin".into(),
            ssh: None,
            progress_marker: None,
        })
        .unwrap();
        job
    }

    #[tokio::test]
    async fn add_and_find_round_trip() {
        let tmp = tempdir().unwrap();
        let registry = JobRegistry::new();
        let job = configured_job(tmp.path(), "a", vec!["true".into()]).await;
        registry.add(job.clone()).await.unwrap();
        assert!(registry.find("a").await.is_some());
        assert!(registry.find("b").await.is_none());
        assert_eq!(registry.ids().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let tmp = tempdir().unwrap();
        let registry = JobRegistry::new();
        let job = configured_job(tmp.path(), "a", vec!["true".into()]).await;
        registry.add(job.clone()).await.unwrap();
        let other = configured_job(tmp.path(), "a", vec!["true".into()]).await;
        let err = registry.add(other).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn unparameterized_jobs_cannot_be_registered() {
        let registry = JobRegistry::new();
        let job = Arc::new(Job::new(fast_opts()));
        let err = registry.add(job).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn removing_a_live_job_cancels_and_waits() {
        let tmp = tempdir().unwrap();
        let registry = JobRegistry::new();
        let job = configured_job(
            tmp.path(),
            "long",
            vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()],
        )
        .await;
        registry.add(job.clone()).await.unwrap();
        job.start(None).unwrap();

        let removed = registry.remove("long").await.unwrap();
        assert_eq!(removed.state(), JobState::CleanedUp);
        assert_eq!(removed.outcome(), Some(JobOutcome::Cancelled));
        assert!(registry.find("long").await.is_none());
    }

    #[tokio::test]
    async fn cancel_by_id_reaches_the_job() {
        let tmp = tempdir().unwrap();
        let registry = JobRegistry::new();
        let job = configured_job(
            tmp.path(),
            "c",
            vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()],
        )
        .await;
        registry.add(job.clone()).await.unwrap();
        job.start(None).unwrap();

        assert!(registry.cancel("c").await);
        assert!(!registry.cancel("missing").await);
        job.wait_terminal().await;
        assert_eq!(job.outcome(), Some(JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn removing_an_unstarted_job_goes_terminal() {
        let tmp = tempdir().unwrap();
        let registry = JobRegistry::new();
        let job = configured_job(tmp.path(), "idle", vec!["true".into()]).await;
        registry.add(job.clone()).await.unwrap();
        let removed = registry.remove("idle").await.unwrap();
        assert_eq!(removed.outcome(), Some(JobOutcome::Cancelled));
    }
}
