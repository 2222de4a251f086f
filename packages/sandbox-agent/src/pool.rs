//! Warm pool (C3): a bounded set of worker handles for one dependency-set
//! fingerprint. LIFO acquire over Ready handles ("warmer caches preferred"),
//! FIFO waiter queue, replacement only on death, no idle eviction.
//! Generalized from the teacher's `task.rs::ExecutionPool` (a channel-fed
//! static thread pool) to async acquire/release with waiters, and its
//! introspection style borrowed from
//! `instance_manager.rs::InstanceManager::list_instances`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::worker_handle::{WorkerHandle, WorkerState};

struct Inner {
    ready: Vec<WorkerHandle>,
    waiters: VecDeque<oneshot::Sender<WorkerHandle>>,
    live: usize,
    pids: HashMap<u64, u32>,
    next_id: u64,
}

/// A point-in-time, non-wire-protocol view of pool occupancy, used by tests
/// and operational tooling — not a new HTTP endpoint.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub fingerprint: String,
    pub target: usize,
    pub live: usize,
    pub ready: usize,
    pub busy: usize,
    pub waiters: usize,
    pub worker_pids: Vec<u32>,
}

pub struct WarmPool {
    fingerprint: String,
    target: usize,
    config: Arc<Config>,
    environment_path: PathBuf,
    worker_bin: PathBuf,
    memory_mb: u64,
    cpus: u32,
    inner: Mutex<Inner>,
}

enum AcquireDecision {
    Ready(WorkerHandle),
    Spawn(u64),
    Wait(oneshot::Receiver<WorkerHandle>),
}

impl WarmPool {
    /// Creates the pool's bookkeeping only; no worker is spawned yet. The
    /// pool is available the moment this returns, even with zero Ready
    /// workers — its bookkeeping structures already exist. Resource limits
    /// (`memory_mb`/`cpus`) are fixed from the job
    /// that first triggered pool creation — the fingerprint depends only on
    /// dependencies, so every worker spawned into this pool shares them.
    pub fn new(
        fingerprint: String,
        config: Arc<Config>,
        environment_path: PathBuf,
        worker_bin: PathBuf,
        memory_mb: u64,
        cpus: u32,
    ) -> Self {
        let target = config.pool_size;
        WarmPool {
            fingerprint,
            target,
            config,
            environment_path,
            worker_bin,
            memory_mb,
            cpus,
            inner: Mutex::new(Inner {
                ready: Vec::new(),
                waiters: VecDeque::new(),
                live: 0,
                pids: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Returns a Ready handle, marking it Busy, blocking until one is
    /// available or `deadline` elapses.
    pub async fn acquire(&self, deadline: Duration) -> Result<WorkerHandle> {
        let decision = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.ready.pop() {
                AcquireDecision::Ready(handle)
            } else if inner.live < self.target {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.live += 1;
                AcquireDecision::Spawn(id)
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                AcquireDecision::Wait(rx)
            }
        };

        match decision {
            AcquireDecision::Ready(handle) => Ok(handle),
            AcquireDecision::Spawn(id) => match self.spawn_one(id).await {
                Ok(handle) => {
                    let mut inner = self.inner.lock().await;
                    inner.pids.insert(handle.id(), handle.pid());
                    Ok(handle)
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.live -= 1;
                    Err(e)
                }
            },
            AcquireDecision::Wait(rx) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(_)) => Err(AgentError::AgentInternal(
                    "pool shut down while waiting for a handle".to_string(),
                )),
                Err(_) => Err(AgentError::PoolSaturated),
            },
        }
    }

    async fn spawn_one(&self, id: u64) -> Result<WorkerHandle> {
        let handle = WorkerHandle::spawn(
            id,
            &self.config,
            &self.environment_path,
            &self.worker_bin,
            self.memory_mb,
            self.cpus,
        )
        .await?;
        info!(fingerprint = %self.fingerprint, worker_id = id, pid = handle.pid(), "worker spawned");
        Ok(handle)
    }

    /// Returns a handle to the pool. A Dead handle is
    /// dropped and, if the pool is now below target and a waiter exists, a
    /// replacement is spawned and handed directly to the oldest waiter.
    pub async fn release(&self, handle: WorkerHandle) {
        if handle.state() == WorkerState::Dead {
            self.release_dead(handle).await;
        } else {
            self.release_ready(handle).await;
        }
    }

    async fn release_ready(&self, handle: WorkerHandle) {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = inner.waiters.pop_front() {
            drop(inner);
            // Handing the handle straight to the waiter keeps exactly one
            // wakeup per release without a round trip through the ready list.
            if tx.send(handle).is_err() {
                warn!("waiter dropped before receiving its handle");
            }
        } else {
            inner.ready.push(handle);
        }
    }

    async fn release_dead(&self, mut handle: WorkerHandle) {
        // A Dead handle may still own a live child (e.g. a timed-out RPC
        // leaves the worker process running past its deadline). Reap it here
        // so a dead handle never just falls out of scope: no orphan children
        // should survive past the request that killed their handle.
        handle.shutdown().await;

        let mut inner = self.inner.lock().await;
        inner.live -= 1;
        inner.pids.remove(&handle.id());
        let Some(tx) = inner.waiters.pop_front() else {
            return;
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live += 1;
        drop(inner);

        match self.spawn_one(id).await {
            Ok(replacement) => {
                let mut inner = self.inner.lock().await;
                inner.pids.insert(replacement.id(), replacement.pid());
                drop(inner);
                if tx.send(replacement).is_err() {
                    warn!("waiter dropped before receiving its replacement handle");
                }
            }
            Err(e) => {
                warn!(fingerprint = %self.fingerprint, error = %e, "replacement spawn failed");
                let mut inner = self.inner.lock().await;
                inner.live -= 1;
                // Dropping `tx` here fails the waiter's `acquire` with a
                // terminal error; the waiter is not re-queued.
            }
        }
    }

    /// Point-in-time occupancy snapshot.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().await;
        PoolSnapshot {
            fingerprint: self.fingerprint.clone(),
            target: self.target,
            live: inner.live,
            ready: inner.ready.len(),
            busy: inner.live.saturating_sub(inner.ready.len()),
            waiters: inner.waiters.len(),
            worker_pids: inner.pids.values().copied().collect(),
        }
    }

    /// Cancels all pending waiters with a terminal error and shuts down
    /// every Ready handle in parallel. Busy handles
    /// checked out by in-flight requests are shut down by their callers as
    /// those requests unwind.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.waiters.clear();
        let ready = std::mem::take(&mut inner.ready);
        drop(inner);

        // Each shutdown runs on its own task so the `wait briefly / signal /
        // wait again` sequence in `WorkerHandle::shutdown` happens for every
        // handle concurrently rather than one at a time.
        let tasks: Vec<_> = ready
            .into_iter()
            .map(|mut handle| tokio::spawn(async move { handle.shutdown().await }))
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_starts_empty() {
        let config = Arc::new(Config::from_env());
        let pool = WarmPool::new(
            "0000000000000000".to_string(),
            config,
            PathBuf::from("/tmp/env"),
            PathBuf::from("/usr/bin/true"),
            512,
            1,
        );
        let snap = pool.snapshot().await;
        assert_eq!(snap.live, 0);
        assert_eq!(snap.ready, 0);
        assert_eq!(snap.busy, 0);
        assert_eq!(snap.waiters, 0);
    }
}
