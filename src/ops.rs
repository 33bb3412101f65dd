use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

pub type RunId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Cancelling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: RunId,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

#[derive(Debug)]
struct RunHandle {
    token: CancellationToken,
    started: Instant,
}

/// Caller-owned table of in-flight runs. Bounds how many may run at once and
/// lets another task cancel a run by id.
#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<DashMap<RunId, (RunState, Arc<RunHandle>)>>,
    permits: Arc<Semaphore>,
}

impl RunRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Wait for a free slot, then register the run.
    pub async fn begin(&self, root: &Path) -> RunTicket {
        // The semaphore is never closed, so acquisition only fails if that invariant breaks.
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        };
        self.register(root, permit)
    }

    /// Register only if a slot is free right now.
    pub fn try_begin(&self, root: &Path) -> Option<RunTicket> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(self.register(root, Some(permit))),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn register(&self, root: &Path, permit: Option<OwnedSemaphorePermit>) -> RunTicket {
        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let state = RunState {
            id: id.clone(),
            root: root.to_path_buf(),
            started_at: Utc::now(),
            status: RunStatus::Running,
        };
        let handle = Arc::new(RunHandle {
            token: token.clone(),
            started: Instant::now(),
        });
        self.inner.insert(id.clone(), (state, handle));
        log::debug!("Registered run {} for {}", id, root.display());
        RunTicket {
            id,
            token,
            registry: self.clone(),
            _permit: permit,
        }
    }

    pub fn get(&self, id: &str) -> Option<RunState> {
        self.inner.get(id).map(|e| e.0.clone())
    }

    pub fn active(&self) -> Vec<RunState> {
        let mut runs: Vec<RunState> = self.inner.iter().map(|e| e.0.clone()).collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub fn cancel(&self, id: &str) -> bool {
        if let Some(mut entry) = self.inner.get_mut(id) {
            entry.0.status = RunStatus::Cancelling;
            entry.1.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        for mut entry in self.inner.iter_mut() {
            entry.0.status = RunStatus::Cancelling;
            entry.1.token.cancel();
        }
    }

    fn finish(&self, id: &str) {
        if let Some((_, (_, handle))) = self.inner.remove(id) {
            log::debug!("Run {} released after {:?}", id, handle.started.elapsed());
        }
    }
}

/// Held for the lifetime of a run. Dropping it frees the slot and forgets the run,
/// whichever way the run ended.
pub struct RunTicket {
    id: RunId,
    token: CancellationToken,
    registry: RunRegistry,
    _permit: Option<OwnedSemaphorePermit>,
}

impl RunTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.registry.finish(&self.id);
    }
}
