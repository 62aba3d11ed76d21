// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, anyhow};
use russh::client::AuthResult;
use russh::keys::PrivateKeyWithHashAlg;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::errors::{JobError, JobResult};

use super::{ClientHandler, Credential, SessionManager};

fn auth_succeeded(result: &AuthResult) -> bool {
    matches!(result, AuthResult::Success)
}

impl SessionManager {
    /// Connect and authenticate, atomically: the handle is stored only when
    /// both steps succeed, otherwise the session stays unusable.
    pub async fn connect(&self) -> JobResult<()> {
        let mut handle_field = self.handle.lock().await;

        // If a handle exists but is closed, drop it so we reconnect.
        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            return Ok(());
        }

        let handle = self
            .connect_inner()
            .await
            .map_err(|e| JobError::Auth(format!("{e:#}")))?;
        *handle_field = Some(handle);
        drop(handle_field);

        self.spawn_keepalive().await;
        Ok(())
    }

    async fn connect_inner(&self) -> Result<russh::client::Handle<ClientHandler>> {
        let addr = self.resolve_addr().await?;
        log::info!(
            "establishing connection with {}@{}",
            &self.params.username,
            addr
        );
        let mut handle = russh::client::connect(self.config.clone(), addr, ClientHandler)
            .await
            .context("SSH connect failed")?;

        let result = match &self.params.credential {
            Credential::Password(password) => handle
                .authenticate_password(self.params.username.clone(), password.clone())
                .await
                .context("password authentication request failed")?,
            Credential::KeyFile(path) => {
                let key = russh::keys::load_secret_key(path, None)
                    .with_context(|| format!("failed to load secret key at {}", path.display()))?;
                let key = Arc::new(key);
                // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
                let pk = PrivateKeyWithHashAlg::new(
                    key,
                    handle.best_supported_rsa_hash().await?.flatten(),
                );
                handle
                    .authenticate_publickey(self.params.username.clone(), pk)
                    .await
                    .context("publickey authentication request failed")?
            }
        };

        if !auth_succeeded(&result) {
            return Err(anyhow!(
                "authentication rejected for {}@{}:{}",
                self.params.username,
                self.params.host,
                self.params.port
            ));
        }
        log::info!(
            "authenticated {}@{}:{}",
            &self.params.username,
            &self.params.host,
            self.params.port
        );
        Ok(handle)
    }

    async fn resolve_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.params.host, self.params.port);
        tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("failed to resolve {target}"))?
            .next()
            .ok_or_else(|| anyhow!("no addresses found for {target}"))
    }

    async fn spawn_keepalive(&self) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        let handle_clone = self.handle.clone();
        let want_reply = true;
        let jh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval / 2);
            loop {
                ticker.tick().await;
                let guard = handle_clone.lock().await;
                let Some(handle) = guard.as_ref() else {
                    continue;
                };
                if handle.is_closed() {
                    log::debug!("keepalive handle is closed");
                    break;
                }
                if let Err(e) = handle.send_keepalive(want_reply).await {
                    log::debug!("error when sending a keepalive: {}", e);
                }
            }
        });
        *self.keepalive_task_handle.lock().await = Some(jh);
    }
}
