// SPDX-License-Identifier: AGPL-3.0-only

//! Single-file uploads and downloads with directory auto-creation.
//!
//! Directories created on the way to a destination are recorded and returned
//! in reverse creation order, so iterating the list forward is always a safe
//! deletion order (leaves before parents). Cancellation mid-upload rolls the
//! partial artifact and those directories back; any other I/O failure
//! propagates without rollback since a retry may want the directories.

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use std::path::{Path, PathBuf};
use tokio::fs as tokiofs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{JobError, JobResult};
use crate::exec::ExecutionContext;
use crate::progress::ProgressSink;
use crate::util::remote_parent_dirs;

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
        }
    }
}

/// Forwards byte-count progress only when an integer percentage boundary is
/// crossed, so chunked loops cannot flood observers.
struct PercentThrottle {
    total: i64,
    last_pct: i64,
}

impl PercentThrottle {
    fn new(total: i64) -> Self {
        Self {
            total,
            last_pct: -1,
        }
    }

    fn crossed(&mut self, current: i64) -> bool {
        if self.total <= 0 {
            return false;
        }
        let pct = (current.clamp(0, self.total)) * 100 / self.total;
        if pct > self.last_pct {
            self.last_pct = pct;
            return true;
        }
        false
    }
}

enum CopyOutcome {
    Completed,
    Interrupted,
}

async fn copy_chunks<R, W>(
    mut reader: R,
    mut writer: W,
    total: i64,
    label: &str,
    sink: &dyn ProgressSink,
    chunk_size: usize,
) -> JobResult<CopyOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut throttle = PercentThrottle::new(total);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut done: i64 = 0;
    loop {
        if sink.interrupted() {
            let _ = writer.shutdown().await;
            return Ok(CopyOutcome::Interrupted);
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| JobError::Transfer(format!("read failed during {label}: {e}")))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| JobError::Transfer(format!("write failed during {label}: {e}")))?;
        done += n as i64;
        if throttle.crossed(done) {
            sink.report(label, done, total);
        }
    }
    writer
        .shutdown()
        .await
        .map_err(|e| JobError::Transfer(format!("flush failed during {label}: {e}")))?;
    sink.report(label, total.max(done), total);
    Ok(CopyOutcome::Completed)
}

fn transfer_label(verb: &str, path_tail: &str) -> String {
    let name = path_tail.rsplit(['/', std::path::MAIN_SEPARATOR]).next().unwrap_or(path_tail);
    format!("{verb} {name}")
}

/// Upload one local file to `remote`, creating missing parent directories.
///
/// Returns the directories this call created, leaf first, ready for reverse
/// cleanup. On cancellation the partial file and those directories are
/// removed before `Cancelled` is returned.
pub async fn upload(
    ctx: &ExecutionContext,
    local: &Path,
    remote: &str,
    sink: &dyn ProgressSink,
    opts: &TransferOptions,
) -> JobResult<Vec<String>> {
    match ctx {
        ExecutionContext::Remote(session) => {
            let sftp = session.sftp().await.map_err(JobError::transfer)?;
            upload_sftp(&sftp, local, remote, sink, opts).await
        }
        ExecutionContext::Local => upload_local(local, remote, sink, opts).await,
    }
}

async fn upload_sftp(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    sink: &dyn ProgressSink,
    opts: &TransferOptions,
) -> JobResult<Vec<String>> {
    let mut created: Vec<String> = Vec::new();
    for dir in remote_parent_dirs(remote) {
        match sftp.metadata(dir.as_str()).await {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(JobError::Transfer(format!(
                        "remote path exists but is not a directory: {dir}"
                    )));
                }
            }
            Err(_) => {
                sftp.create_dir(dir.as_str())
                    .await
                    .map_err(|e| JobError::Transfer(format!("creating {dir}: {e}")))?;
                created.push(dir);
            }
        }
    }
    created.reverse();

    let lf = tokiofs::File::open(local)
        .await
        .map_err(|e| JobError::Transfer(format!("opening {}: {e}", local.display())))?;
    let total = file_len(&lf).await?;
    let flags = OpenFlags::WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::TRUNCATE);
    let rfile = sftp
        .open_with_flags(remote, flags)
        .await
        .map_err(|e| JobError::Transfer(format!("opening remote {remote}: {e}")))?;

    let label = transfer_label("Uploading", remote);
    match copy_chunks(lf, rfile, total, &label, sink, opts.chunk_size).await? {
        CopyOutcome::Completed => Ok(created),
        CopyOutcome::Interrupted => {
            rollback_sftp(sftp, remote, &created).await;
            Err(JobError::Cancelled)
        }
    }
}

async fn upload_local(
    local: &Path,
    dest: &str,
    sink: &dyn ProgressSink,
    opts: &TransferOptions,
) -> JobResult<Vec<String>> {
    let mut created: Vec<String> = Vec::new();
    for dir in remote_parent_dirs(dest) {
        match tokiofs::metadata(&dir).await {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(JobError::Transfer(format!(
                        "path exists but is not a directory: {dir}"
                    )));
                }
            }
            Err(_) => {
                tokiofs::create_dir(&dir)
                    .await
                    .map_err(|e| JobError::Transfer(format!("creating {dir}: {e}")))?;
                created.push(dir);
            }
        }
    }
    created.reverse();

    let lf = tokiofs::File::open(local)
        .await
        .map_err(|e| JobError::Transfer(format!("opening {}: {e}", local.display())))?;
    let total = file_len(&lf).await?;
    let dest_file = tokiofs::File::create(dest)
        .await
        .map_err(|e| JobError::Transfer(format!("creating {dest}: {e}")))?;

    let label = transfer_label("Uploading", dest);
    match copy_chunks(lf, dest_file, total, &label, sink, opts.chunk_size).await? {
        CopyOutcome::Completed => Ok(created),
        CopyOutcome::Interrupted => {
            rollback_local(dest, &created).await;
            Err(JobError::Cancelled)
        }
    }
}

/// Download one remote file into `local`, creating missing local parent
/// directories. The created directories are returned for best-effort caller
/// cleanup; a cancelled or failed download performs no rollback of its own.
pub async fn download(
    ctx: &ExecutionContext,
    remote: &str,
    local: &Path,
    sink: &dyn ProgressSink,
    opts: &TransferOptions,
) -> JobResult<Vec<PathBuf>> {
    let created = create_local_parents(local).await?;
    let label = transfer_label("Retrieving", &local.display().to_string());

    let outcome = match ctx {
        ExecutionContext::Remote(session) => {
            let sftp = session.sftp().await.map_err(JobError::transfer)?;
            let meta = sftp
                .metadata(remote)
                .await
                .map_err(|e| JobError::Transfer(format!("remote {remote}: {e}")))?;
            let total = meta.size.map(|s| s as i64).unwrap_or(0);
            let rfile = sftp
                .open(remote)
                .await
                .map_err(|e| JobError::Transfer(format!("opening remote {remote}: {e}")))?;
            let lfile = tokiofs::File::create(local)
                .await
                .map_err(|e| JobError::Transfer(format!("creating {}: {e}", local.display())))?;
            copy_chunks(rfile, lfile, total, &label, sink, opts.chunk_size).await?
        }
        ExecutionContext::Local => {
            let src = tokiofs::File::open(remote)
                .await
                .map_err(|e| JobError::Transfer(format!("opening {remote}: {e}")))?;
            let total = file_len(&src).await?;
            let lfile = tokiofs::File::create(local)
                .await
                .map_err(|e| JobError::Transfer(format!("creating {}: {e}", local.display())))?;
            copy_chunks(src, lfile, total, &label, sink, opts.chunk_size).await?
        }
    };

    match outcome {
        CopyOutcome::Completed => Ok(created),
        CopyOutcome::Interrupted => Err(JobError::Cancelled),
    }
}

pub async fn remove_file(ctx: &ExecutionContext, path: &str) -> JobResult<()> {
    match ctx {
        ExecutionContext::Remote(session) => {
            let sftp = session.sftp().await.map_err(JobError::transfer)?;
            sftp.remove_file(path)
                .await
                .map_err(|e| JobError::Transfer(format!("removing {path}: {e}")))
        }
        ExecutionContext::Local => tokiofs::remove_file(path)
            .await
            .map_err(|e| JobError::Transfer(format!("removing {path}: {e}"))),
    }
}

/// Remove an empty directory.
pub async fn remove_folder(ctx: &ExecutionContext, path: &str) -> JobResult<()> {
    match ctx {
        ExecutionContext::Remote(session) => {
            let sftp = session.sftp().await.map_err(JobError::transfer)?;
            sftp.remove_dir(path)
                .await
                .map_err(|e| JobError::Transfer(format!("removing {path}: {e}")))
        }
        ExecutionContext::Local => tokiofs::remove_dir(path)
            .await
            .map_err(|e| JobError::Transfer(format!("removing {path}: {e}"))),
    }
}

async fn file_len(file: &tokiofs::File) -> JobResult<i64> {
    let meta = file
        .metadata()
        .await
        .map_err(|e| JobError::Transfer(format!("stat failed: {e}")))?;
    Ok(meta.len() as i64)
}

/// Missing ancestors of `path`'s parent, created shallow to deep, returned
/// leaf first for cleanup.
async fn create_local_parents(path: &Path) -> JobResult<Vec<PathBuf>> {
    let Some(parent) = path.parent() else {
        return Ok(Vec::new());
    };
    let mut missing: Vec<PathBuf> = Vec::new();
    let mut cursor = parent;
    loop {
        if cursor.as_os_str().is_empty() || cursor.exists() {
            break;
        }
        missing.push(cursor.to_path_buf());
        let Some(next) = cursor.parent() else { break };
        cursor = next;
    }
    // shallowest first for creation
    for dir in missing.iter().rev() {
        tokiofs::create_dir(dir)
            .await
            .map_err(|e| JobError::Transfer(format!("creating {}: {e}", dir.display())))?;
    }
    Ok(missing)
}

async fn rollback_sftp(sftp: &SftpSession, partial_file: &str, created_dirs: &[String]) {
    if let Err(e) = sftp.remove_file(partial_file).await {
        log::warn!("rollback: failed to remove partial upload {partial_file}: {e}");
    }
    for dir in created_dirs {
        if let Err(e) = sftp.remove_dir(dir.as_str()).await {
            log::warn!("rollback: failed to remove directory {dir}: {e}");
        }
    }
}

async fn rollback_local(partial_file: &str, created_dirs: &[String]) {
    if let Err(e) = tokiofs::remove_file(partial_file).await {
        log::warn!("rollback: failed to remove partial upload {partial_file}: {e}");
    }
    for dir in created_dirs {
        if let Err(e) = tokiofs::remove_dir(dir).await {
            log::warn!("rollback: failed to remove directory {dir}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::test_support::RecordingSink;
    use tempfile::tempdir;

    fn opts(chunk_size: usize) -> TransferOptions {
        TransferOptions { chunk_size }
    }

    #[test]
    fn percent_throttle_fires_on_integer_boundaries_only() {
        let mut throttle = PercentThrottle::new(1000);
        assert!(throttle.crossed(5)); // 0%
        assert!(!throttle.crossed(9)); // still 0%
        assert!(throttle.crossed(10)); // 1%
        assert!(!throttle.crossed(14));
        assert!(throttle.crossed(1000)); // 100%
        assert!(!throttle.crossed(1000));
    }

    #[test]
    fn percent_throttle_silent_when_total_unknown() {
        let mut throttle = PercentThrottle::new(0);
        assert!(!throttle.crossed(100));
    }

    #[tokio::test]
    async fn upload_creates_missing_directories_in_order() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let src = tmp.path().join("payload.bin");
        tokiofs::write(&src, vec![7u8; 64 * 1024]).await.unwrap();

        let dest = format!("{root}/a/b/c/out.bin");
        let sink = RecordingSink::default();
        let created = upload(&ExecutionContext::Local, &src, &dest, &sink, &opts(8192))
            .await
            .unwrap();

        // reverse creation order: leaf first
        assert_eq!(
            created,
            vec![
                format!("{root}/a/b/c"),
                format!("{root}/a/b"),
                format!("{root}/a"),
            ]
        );
        let written = tokiofs::read(&dest).await.unwrap();
        assert_eq!(written.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn upload_reports_progress_and_finishes_at_total() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("payload.bin");
        tokiofs::write(&src, vec![1u8; 10_000]).await.unwrap();
        let dest = tmp.path().join("out.bin").to_str().unwrap().to_string();

        let sink = RecordingSink::default();
        upload(&ExecutionContext::Local, &src, &dest, &sink, &opts(1000))
            .await
            .unwrap();

        let reports = sink.reports();
        assert!(!reports.is_empty());
        let (_, last_current, last_total) = reports.last().unwrap().clone();
        assert_eq!(last_current, 10_000);
        assert_eq!(last_total, 10_000);
        let currents: Vec<i64> = reports.iter().map(|(_, c, _)| *c).collect();
        assert!(currents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn cancelled_upload_rolls_back_file_and_directories() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let src = tmp.path().join("payload.bin");
        tokiofs::write(&src, vec![2u8; 100_000]).await.unwrap();
        let dest = format!("{root}/x/y/out.bin");

        // interrupt after the first progress report, mid-transfer
        let sink = RecordingSink::interrupting_after(1);
        let err = upload(&ExecutionContext::Local, &src, &dest, &sink, &opts(1000))
            .await
            .unwrap_err();
        assert_eq!(err, JobError::Cancelled);

        // nothing created this attempt survives
        assert!(!Path::new(&dest).exists());
        assert!(!Path::new(&format!("{root}/x/y")).exists());
        assert!(!Path::new(&format!("{root}/x")).exists());
    }

    #[tokio::test]
    async fn io_failure_propagates_without_rollback() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let missing_src = tmp.path().join("does-not-exist.bin");
        let dest = format!("{root}/keep/me/out.bin");

        let sink = RecordingSink::default();
        let err = upload(
            &ExecutionContext::Local,
            &missing_src,
            &dest,
            &sink,
            &opts(1000),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Transfer(_)));
        // directories created before the failure stay for a potential retry
        assert!(Path::new(&format!("{root}/keep/me")).is_dir());
    }

    #[tokio::test]
    async fn upload_overwrites_existing_destination() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("payload.bin");
        tokiofs::write(&src, b"short").await.unwrap();
        let dest = tmp.path().join("out.bin");
        tokiofs::write(&dest, vec![9u8; 4096]).await.unwrap();

        let sink = RecordingSink::default();
        upload(
            &ExecutionContext::Local,
            &src,
            dest.to_str().unwrap(),
            &sink,
            &opts(1024),
        )
        .await
        .unwrap();
        assert_eq!(tokiofs::read(&dest).await.unwrap(), b"short");
    }

    #[tokio::test]
    async fn download_creates_local_parents_and_reports_them() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("result.bin");
        tokiofs::write(&src, vec![3u8; 2048]).await.unwrap();
        let dest = tmp.path().join("fetched/deep/out.bin");

        let sink = RecordingSink::default();
        let created = download(
            &ExecutionContext::Local,
            src.to_str().unwrap(),
            &dest,
            &sink,
            &opts(512),
        )
        .await
        .unwrap();

        assert_eq!(
            created,
            vec![tmp.path().join("fetched/deep"), tmp.path().join("fetched")]
        );
        assert_eq!(tokiofs::read(&dest).await.unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn cancelled_download_surfaces_without_rollback() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("result.bin");
        tokiofs::write(&src, vec![4u8; 100_000]).await.unwrap();
        let dest = tmp.path().join("out.bin");

        let sink = RecordingSink::interrupting_after(1);
        let err = download(
            &ExecutionContext::Local,
            src.to_str().unwrap(),
            &dest,
            &sink,
            &opts(1000),
        )
        .await
        .unwrap_err();
        assert_eq!(err, JobError::Cancelled);
    }

    #[tokio::test]
    async fn remove_file_and_folder_work_locally() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("staging");
        tokiofs::create_dir(&dir).await.unwrap();
        let file = dir.join("a.bin");
        tokiofs::write(&file, b"x").await.unwrap();

        remove_file(&ExecutionContext::Local, file.to_str().unwrap())
            .await
            .unwrap();
        remove_folder(&ExecutionContext::Local, dir.to_str().unwrap())
            .await
            .unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn remove_folder_fails_on_nonempty_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("staging");
        tokiofs::create_dir(&dir).await.unwrap();
        tokiofs::write(dir.join("a.bin"), b"x").await.unwrap();

        let err = remove_folder(&ExecutionContext::Local, dir.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Transfer(_)));
    }
}
