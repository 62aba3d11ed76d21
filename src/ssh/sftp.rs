// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;

use super::SessionManager;

impl SessionManager {
    /// Open a fresh SFTP subsystem channel on the active connection.
    pub(crate) async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .context("starting SFTP session")?;
        Ok(sftp)
    }
}
