//! Pool registry (C4, half): fingerprint → Pool, with the `ensure_pool`
//! fast/slow path from spec.md §4.4. Generalized from the teacher's
//! `instance_manager.rs::InstanceManager` registry-with-lock shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::environment::EnvironmentCache;
use crate::error::Result;
use crate::job::DependencySet;
use crate::pool::{PoolSnapshot, WarmPool};

pub struct PoolRegistry {
    config: Arc<Config>,
    worker_bin: PathBuf,
    environments: EnvironmentCache,
    pools: RwLock<HashMap<String, Arc<WarmPool>>>,
    /// Serializes the slow path end to end (environment build + pool
    /// insertion) across *all* fingerprints, exactly as spec.md §4.4
    /// describes it ("slow path under a registry-wide lock"). Per-fingerprint
    /// parallelism for the fast, already-built case is unaffected — this
    /// lock is only taken while bringing a brand-new fingerprint online.
    create_lock: Mutex<()>,
}

impl PoolRegistry {
    pub fn new(config: Arc<Config>, worker_bin: PathBuf) -> Self {
        PoolRegistry {
            environments: EnvironmentCache::new(&config),
            config,
            worker_bin,
            pools: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// `ensurePool` (spec.md §4.4): returns the Pool for `dependencies`,
    /// building its environment and creating the pool on first use.
    /// `memory_mb`/`cpus` size the workers of a newly created pool only —
    /// an existing pool keeps the resource limits it was created with.
    pub async fn ensure_pool(
        &self,
        dependencies: &DependencySet,
        memory_mb: u64,
        cpus: u32,
    ) -> Result<Arc<WarmPool>> {
        if let Some(pool) = self.pools.read().await.get(dependencies.fingerprint()) {
            return Ok(pool.clone());
        }

        let _guard = self.create_lock.lock().await;

        // Re-check: another caller may have finished the slow path while we
        // waited for `create_lock` — at most one Pool is ever created per
        // fingerprint.
        if let Some(pool) = self.pools.read().await.get(dependencies.fingerprint()) {
            return Ok(pool.clone());
        }

        let environment = self.environments.ensure(dependencies).await?;
        let pool = Arc::new(WarmPool::new(
            dependencies.fingerprint().to_string(),
            self.config.clone(),
            environment.path,
            self.worker_bin.clone(),
            memory_mb,
            cpus,
        ));

        self.pools
            .write()
            .await
            .insert(dependencies.fingerprint().to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn snapshot(&self, fingerprint: &str) -> Option<PoolSnapshot> {
        let pools = self.pools.read().await;
        let pool = pools.get(fingerprint)?;
        Some(pool.snapshot().await)
    }

    /// Shuts down every pool in parallel, driven here for the whole registry
    /// at agent shutdown so no worker child outlives the agent process.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools.read().await.values().cloned().collect();
        let tasks: Vec<_> = pools
            .into_iter()
            .map(|pool| tokio::spawn(async move { pool.shutdown().await }))
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
