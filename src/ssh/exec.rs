// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::sync::mpsc;

use crate::exec::{ProcessEvent, ProcessHandle, TryEvent};
use crate::exec::process::try_recv_event;

use super::SessionManager;

#[derive(Debug, Clone, Copy)]
enum RemoteSignal {
    Terminate,
    Kill,
}

fn handle_channel_message(msg: &ChannelMsg) -> (Option<ProcessEvent>, bool) {
    match msg {
        ChannelMsg::Data { data } => (Some(ProcessEvent::Stdout(data.to_vec())), false),
        ChannelMsg::ExtendedData { data, ext } if *ext == 1 => {
            (Some(ProcessEvent::Stderr(data.to_vec())), false)
        }
        ChannelMsg::ExitStatus { exit_status } => {
            (Some(ProcessEvent::Exited(*exit_status as i32)), false)
        }
        ChannelMsg::Close => (None, true),
        _ => (None, false),
    }
}

impl SessionManager {
    /// Start `command_line` on the remote host as an exec channel and return
    /// a handle pumping its output events.
    pub(crate) async fn spawn_command(&self, command_line: &str) -> Result<RemoteProcess> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| anyhow!("SSH handle lost"))?;
        let mut chan = handle
            .channel_open_session()
            .await
            .context("open session")?;
        log::debug!("executing '{}'", command_line);
        chan.exec(true, command_line).await.context("exec request")?;
        drop(guard);

        let (evt_tx, evt_rx) = mpsc::channel::<ProcessEvent>(64);
        let (ctl_tx, mut ctl_rx) = mpsc::channel::<RemoteSignal>(4);

        let pump = tokio::spawn(async move {
            let mut ctl_open = true;
            loop {
                tokio::select! {
                    msg = chan.wait() => {
                        let Some(msg) = msg else { break };
                        let (event, should_break) = handle_channel_message(&msg);
                        if let Some(event) = event {
                            let _ = evt_tx.send(event).await;
                        }
                        if should_break {
                            break;
                        }
                    }
                    sig = ctl_rx.recv(), if ctl_open => {
                        match sig {
                            Some(RemoteSignal::Terminate) => {
                                if let Err(e) = chan.signal(russh::Sig::TERM).await {
                                    log::warn!("failed to send TERM to remote process: {e}");
                                }
                            }
                            Some(RemoteSignal::Kill) => {
                                if let Err(e) = chan.signal(russh::Sig::KILL).await {
                                    log::warn!("failed to send KILL to remote process: {e}");
                                }
                            }
                            None => ctl_open = false,
                        }
                    }
                }
            }
            // Be tidy
            let _ = chan.eof().await;
            let _ = chan.close().await;
        });

        Ok(RemoteProcess {
            events: evt_rx,
            ctl: ctl_tx,
            pump,
        })
    }
}

/// Remote exec channel behind the [`ProcessHandle`] interface.
pub struct RemoteProcess {
    events: mpsc::Receiver<ProcessEvent>,
    ctl: mpsc::Sender<RemoteSignal>,
    pump: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl ProcessHandle for RemoteProcess {
    fn try_event(&mut self) -> TryEvent {
        try_recv_event(&mut self.events)
    }

    async fn terminate(&mut self) -> Result<()> {
        self.ctl
            .send(RemoteSignal::Terminate)
            .await
            .map_err(|_| anyhow!("remote exec channel already closed"))
    }

    async fn kill(&mut self) -> Result<()> {
        self.ctl
            .send(RemoteSignal::Kill)
            .await
            .map_err(|_| anyhow!("remote exec channel already closed"))
    }

    async fn disconnect(&mut self) {
        self.pump.abort();
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    #[test]
    fn channel_messages_map_to_events() {
        let msg = ChannelMsg::Data {
            data: CryptoVec::from_slice(b"hi"),
        };
        let (event, should_break) = handle_channel_message(&msg);
        assert!(!should_break);
        assert_eq!(event, Some(ProcessEvent::Stdout(b"hi".to_vec())));

        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"err"),
            ext: 1,
        };
        let (event, _) = handle_channel_message(&msg);
        assert_eq!(event, Some(ProcessEvent::Stderr(b"err".to_vec())));

        let msg = ChannelMsg::ExitStatus { exit_status: 7 };
        let (event, _) = handle_channel_message(&msg);
        assert_eq!(event, Some(ProcessEvent::Exited(7)));

        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"skip"),
            ext: 2,
        };
        let (event, should_break) = handle_channel_message(&msg);
        assert!(event.is_none());
        assert!(!should_break);

        let (event, should_break) = handle_channel_message(&ChannelMsg::Close);
        assert!(event.is_none());
        assert!(should_break);
    }
}
