// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::errors::{JobError, JobResult};

use super::{SessionManager, SshParams};

pub trait SessionFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<SessionManager>;
}

#[derive(Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn build(&self, params: SshParams) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(params))
    }
}

fn should_reuse(identity_matches: bool, connected: bool) -> bool {
    identity_matches && connected
}

/// Exclusive hold on a cached session. The session serves one job at a
/// time; dropping the lease lets the next waiting lease proceed.
pub struct SessionLease {
    session: Arc<SessionManager>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }
}

struct CacheEntry {
    session: Arc<SessionManager>,
    // one permit: at most one job drives the session at a time
    gate: Arc<Semaphore>,
}

impl CacheEntry {
    fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            gate: Arc::new(Semaphore::new(1)),
        }
    }
}

/// Holds the most recently established session so successive jobs against the
/// same (host, port, username) identity share one connection. A request with
/// a differing identity closes the old session before opening a new one; a
/// request while the session is leased waits for the holder to release it.
pub struct SessionCache {
    current: Mutex<Option<CacheEntry>>,
    factory: Arc<dyn SessionFactory>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Arc::new(DefaultSessionFactory))
    }
}

impl SessionCache {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            current: Mutex::new(None),
            factory,
        }
    }

    /// Exclusive lease on a connected session for `params`, reusing the
    /// cached one when its identity matches and it is still connected.
    pub async fn lease(&self, params: SshParams) -> JobResult<SessionLease> {
        let mut slot = self.current.lock().await;
        if let Some(entry) = slot.as_ref() {
            if should_reuse(
                entry.session.matches_identity(&params),
                entry.session.is_connected().await,
            ) {
                log::debug!(
                    "reusing session for {}@{}:{}",
                    params.username,
                    params.host,
                    params.port
                );
                let permit = acquire(&entry.gate).await?;
                return Ok(SessionLease {
                    session: entry.session.clone(),
                    _permit: permit,
                });
            }
            log::info!(
                "closing stale session for {}@{}:{}",
                entry.session.params().username,
                entry.session.params().host,
                entry.session.params().port
            );
            // wait out any current holder before tearing the session down
            let _parting = acquire(&entry.gate).await?;
            entry.session.shutdown().await;
            *slot = None;
        }

        let session = self.factory.build(params);
        session.connect().await?;
        let entry = CacheEntry::new(session.clone());
        let permit = acquire(&entry.gate).await?;
        *slot = Some(entry);
        Ok(SessionLease {
            session,
            _permit: permit,
        })
    }

    pub async fn shutdown(&self) {
        let mut slot = self.current.lock().await;
        if let Some(entry) = slot.take() {
            let _parting = entry.gate.acquire().await.ok();
            entry.session.shutdown().await;
        }
    }
}

async fn acquire(gate: &Arc<Semaphore>) -> JobResult<OwnedSemaphorePermit> {
    gate.clone()
        .acquire_owned()
        .await
        .map_err(|_| JobError::Auth("session is shutting down".into()))
}
