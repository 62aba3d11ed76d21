// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Output and lifecycle events drained by the runner's poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(i32),
}

/// Non-blocking drain result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryEvent {
    Event(ProcessEvent),
    /// Nothing buffered right now, process may still be running.
    Empty,
    /// All event sources finished; nothing more will arrive.
    Closed,
}

/// One running worker process, local subprocess or remote exec channel.
/// Owned exclusively by the runner invocation that created it.
#[async_trait]
pub trait ProcessHandle: Send {
    fn try_event(&mut self) -> TryEvent;

    /// Graceful stop request (SIGTERM or SSH TERM signal). Best effort.
    async fn terminate(&mut self) -> Result<()>;

    /// Forceful stop (SIGKILL or SSH KILL signal). Best effort.
    async fn kill(&mut self) -> Result<()>;

    /// Release any pumps or channels. Called exactly once, last.
    async fn disconnect(&mut self);
}

pub(crate) fn try_recv_event(rx: &mut mpsc::Receiver<ProcessEvent>) -> TryEvent {
    match rx.try_recv() {
        Ok(event) => TryEvent::Event(event),
        Err(TryRecvError::Empty) => TryEvent::Empty,
        Err(TryRecvError::Disconnected) => TryEvent::Closed,
    }
}

/// Local subprocess behind the [`ProcessHandle`] interface.
///
/// stdout/stderr are pumped by background tasks into one event channel; the
/// child itself is owned by a detached waiter task so it is always reaped,
/// which leaves signalling by pid as the control path.
pub struct LocalProcess {
    events: mpsc::Receiver<ProcessEvent>,
    pid: i32,
    readers: Vec<tokio::task::JoinHandle<()>>,
}

impl LocalProcess {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .context("empty argument vector")?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;
        let pid = child.id().context("spawned child has no pid")? as i32;

        let (tx, rx) = mpsc::channel::<ProcessEvent>(64);
        let mut readers = Vec::new();

        let stdout = child.stdout.take().context("child stdout not piped")?;
        readers.push(tokio::spawn(pump_stream(stdout, tx.clone(), false)));
        let stderr = child.stderr.take().context("child stderr not piped")?;
        readers.push(tokio::spawn(pump_stream(stderr, tx.clone(), true)));

        // Detached on purpose: the child must be reaped even if the runner
        // disconnects early after a kill.
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(&status),
                Err(e) => {
                    log::warn!("failed to wait for child {pid}: {e}");
                    -1
                }
            };
            let _ = tx.send(ProcessEvent::Exited(code)).await;
        });

        Ok(Self {
            events: rx,
            pid,
            readers,
        })
    }
}

async fn pump_stream<R: tokio::io::AsyncRead + Unpin>(
    mut stream: R,
    tx: mpsc::Sender<ProcessEvent>,
    is_stderr: bool,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                let event = if is_stderr {
                    ProcessEvent::Stderr(chunk)
                } else {
                    ProcessEvent::Stdout(chunk)
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn try_event(&mut self) -> TryEvent {
        try_recv_event(&mut self.events)
    }

    async fn terminate(&mut self) -> Result<()> {
        send_signal(self.pid, libc::SIGTERM)
    }

    async fn kill(&mut self) -> Result<()> {
        send_signal(self.pid, libc::SIGKILL)
    }

    async fn disconnect(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.events.close();
    }
}

fn send_signal(pid: i32, signal: i32) -> Result<()> {
    // SAFETY: plain kill(2) on a pid we spawned; no memory is touched.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to signal pid {pid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain_until_closed(proc: &mut LocalProcess) -> (Vec<u8>, Vec<u8>, Option<i32>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match proc.try_event() {
                TryEvent::Event(ProcessEvent::Stdout(b)) => out.extend_from_slice(&b),
                TryEvent::Event(ProcessEvent::Stderr(b)) => err.extend_from_slice(&b),
                TryEvent::Event(ProcessEvent::Exited(c)) => code = Some(c),
                TryEvent::Empty => {
                    if code.is_some() {
                        // all senders drop shortly after the exit event
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    if tokio::time::Instant::now() > deadline {
                        break;
                    }
                }
                TryEvent::Closed => break,
            }
        }
        (out, err, code)
    }

    #[tokio::test]
    async fn captures_streams_and_exit_code() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2; exit 3".to_string(),
        ];
        let mut proc = LocalProcess::spawn(&argv).unwrap();
        let (out, err, code) = drain_until_closed(&mut proc).await;
        assert_eq!(String::from_utf8_lossy(&out).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&err).trim(), "err");
        assert_eq!(code, Some(3));
        proc.disconnect().await;
    }

    #[tokio::test]
    async fn kill_reports_signal_exit() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let mut proc = LocalProcess::spawn(&argv).unwrap();
        proc.kill().await.unwrap();
        let (_, _, code) = drain_until_closed(&mut proc).await;
        assert_eq!(code, Some(128 + libc::SIGKILL));
        proc.disconnect().await;
    }

    #[test]
    fn spawn_rejects_empty_argv() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(LocalProcess::spawn(&[]).is_err());
    }
}
