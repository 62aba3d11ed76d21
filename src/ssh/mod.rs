// SPDX-License-Identifier: AGPL-3.0-only

use russh::client::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

mod auth;
mod cache;
mod exec;
mod sftp;

pub use cache::{DefaultSessionFactory, SessionCache, SessionFactory, SessionLease};
pub use exec::RemoteProcess;

/// Minimal russh client handler. We rely on default implementations.
/// TODO: verify server keys against known_hosts instead of accepting them.
#[derive(Clone, Debug, Default)]
struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Exactly one credential is active per session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(***)"),
            Credential::KeyFile(path) => write!(f, "Credential::KeyFile({})", path.display()),
        }
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Send TCP keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
}

impl SshParams {
    /// Session identity: two sessions are interchangeable iff this matches
    /// and both are connected. Credentials are deliberately excluded.
    pub fn identity(&self) -> (&str, u16, &str) {
        (&self.host, self.port, &self.username)
    }

    pub fn matches_identity(&self, other: &SshParams) -> bool {
        self.identity() == other.identity()
    }
}

/// Manager that owns a single long-lived SSH connection to a worker host.
///
/// The handle is only stored after connect and authentication both succeed,
/// so callers can treat `connect` as atomic.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // The active handle, protected by a mutex because we serialize channel use
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    // Background keepalive task
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    #[cfg(test)]
    test_connected: std::sync::atomic::AtomicBool,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs)),
            // reasonable channel buffer and window sizes for streaming
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
            #[cfg(test)]
            test_connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Confirmed connection identity, for callers that persist it for reuse.
    pub fn params(&self) -> &SshParams {
        &self.params
    }

    pub fn matches_identity(&self, params: &SshParams) -> bool {
        self.params.matches_identity(params)
    }

    pub async fn is_connected(&self) -> bool {
        #[cfg(test)]
        if self.test_connected.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        let handle_field = self.handle.lock().await;
        match handle_field.as_ref() {
            None => false,
            Some(h) if h.is_closed() => false,
            Some(_) => true,
        }
    }

    /// Non-async probe for callers that cannot await the handle lock; a
    /// contended lock reads as not connected.
    pub fn is_connected_nonblocking(&self) -> bool {
        #[cfg(test)]
        if self.test_connected.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        let Ok(handle_field) = self.handle.try_lock() else {
            return false;
        };
        match handle_field.as_ref() {
            None => false,
            Some(h) if h.is_closed() => false,
            Some(_) => true,
        }
    }

    pub async fn shutdown(&self) {
        #[cfg(test)]
        self.test_connected.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        let _ = handle_field.take();
    }

    /// Makes the session report connected without a transport, so cache
    /// behavior can be exercised without a reachable host.
    #[cfg(test)]
    pub(crate) fn mark_connected_for_tests(&self) {
        self.test_connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(host: &str, port: u16, user: &str) -> SshParams {
        SshParams {
            host: host.to_string(),
            port,
            username: user.to_string(),
            credential: Credential::Password("secret".into()),
            keepalive_secs: 60,
        }
    }

    #[test]
    fn identity_ignores_credential_and_keepalive() {
        let a = params("worker", 22, "alice");
        let mut b = params("worker", 22, "alice");
        b.credential = Credential::KeyFile(PathBuf::from("/tmp/id"));
        b.keepalive_secs = 5;
        assert!(a.matches_identity(&b));
    }

    #[test]
    fn identity_differs_on_any_field() {
        let a = params("worker", 22, "alice");
        assert!(!a.matches_identity(&params("other", 22, "alice")));
        assert!(!a.matches_identity(&params("worker", 2222, "alice")));
        assert!(!a.matches_identity(&params("worker", 22, "bob")));
    }

    #[test]
    fn credential_debug_redacts_password() {
        let shown = format!("{:?}", Credential::Password("hunter2".into()));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn fresh_session_is_not_connected() {
        let session = SessionManager::new(params("worker", 22, "alice"));
        assert!(!session.is_connected().await);
    }
}
