//! Environment cache (C4, half): fingerprint → on-disk PreparedEnvironment,
//! built at most once per fingerprint by shelling out to a package
//! installer. Generalized from the teacher's `sandbox.rs::create_python_venv`
//! (which shells out to `python3 -m venv` plus `pip install` to build one
//! interpreter tree) into an installer command plus an arbitrary declared
//! dependency list.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::job::DependencySet;

/// A directory on the agent filesystem containing an interpreter and
/// installed packages sufficient to satisfy one DependencySet. Path is a
/// pure function of fingerprint.
#[derive(Debug, Clone)]
pub struct PreparedEnvironment {
    pub path: PathBuf,
}

pub struct EnvironmentCache {
    cache_root: PathBuf,
    installer_bin: String,
    /// Per-fingerprint build locks, created on demand. Deduplicates
    /// concurrent builders for the same fingerprint; the map itself is never
    /// pruned — entries are created lazily and never removed during agent
    /// lifetime.
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvironmentCache {
    pub fn new(config: &Config) -> Self {
        EnvironmentCache {
            cache_root: config.cache_dir.clone(),
            installer_bin: config.installer_bin.clone(),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `dependencies` to a `PreparedEnvironment`, building it if
    /// absent. The empty dependency set reuses the agent's own bundled
    /// interpreter tree and never invokes the installer.
    pub async fn ensure(&self, dependencies: &DependencySet) -> Result<PreparedEnvironment> {
        if dependencies.is_empty() {
            let base = self.cache_root.join("base");
            tokio::fs::create_dir_all(&base).await?;
            return Ok(PreparedEnvironment { path: base });
        }

        let path = self.cache_root.join(dependencies.fingerprint());
        if self.is_ready(&path).await {
            return Ok(PreparedEnvironment { path });
        }

        let lock = self.build_lock_for(dependencies.fingerprint()).await;
        let _guard = lock.lock().await;

        // Re-check under the per-fingerprint lock: another builder may have
        // finished while we were waiting for it: the second caller blocks
        // until the first completes and then sees the finished environment.
        if self.is_ready(&path).await {
            return Ok(PreparedEnvironment { path });
        }

        self.build(&path, dependencies).await?;
        Ok(PreparedEnvironment { path })
    }

    async fn is_ready(&self, path: &std::path::Path) -> bool {
        tokio::fs::try_exists(path.join(".ready")).await.unwrap_or(false)
    }

    async fn build_lock_for(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates a fresh sandbox directory, installs the declared dependencies,
    /// and writes a completion-marker file only on success — so a
    /// partially-built directory is never mistaken for ready.
    async fn build(&self, path: &std::path::Path, dependencies: &DependencySet) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(path).await.ok();
        }
        tokio::fs::create_dir_all(path).await?;

        info!(
            fingerprint = dependencies.fingerprint(),
            deps = ?dependencies.dependencies(),
            "building environment"
        );

        let output = Command::new(&self.installer_bin)
            .arg("install")
            .arg("--target")
            .arg(path)
            .args(dependencies.dependencies())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                tokio::fs::write(path.join(".ready"), b"").await?;
                Ok(())
            }
            Ok(out) => {
                let detail = String::from_utf8_lossy(&out.stderr).to_string();
                warn!(fingerprint = dependencies.fingerprint(), %detail, "installer exited nonzero");
                let _ = tokio::fs::remove_dir_all(path).await;
                Err(AgentError::DependencyInstall(detail))
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(path).await;
                Err(AgentError::DependencyInstall(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_dependencies_reuse_base_without_installer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.cache_dir = tmp.path().to_path_buf();
        let cache = EnvironmentCache::new(&config);
        let deps = DependencySet::new(vec![]);
        let env = cache.ensure(&deps).await.unwrap();
        assert_eq!(env.path, tmp.path().join("base"));
        assert!(!tmp.path().join(deps.fingerprint()).exists());
    }

    /// Writes a fake installer that appends one line to `counter_path` per
    /// invocation, ignoring the rest of its arguments, so concurrent
    /// `ensure()` calls for the same fingerprint can prove the installer ran
    /// at most once.
    fn write_counting_installer(dir: &std::path::Path, counter_path: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("fake-installer.sh");
        let script = format!(
            "#!/bin/sh\necho invoked >> {}\nexit 0\n",
            counter_path.display()
        );
        std::fs::write(&script_path, script).unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    /// The package installer is invoked at most once per fingerprint, even
    /// under concurrent first-use.
    #[tokio::test]
    async fn concurrent_first_use_invokes_installer_once() {
        let tmp = tempfile::tempdir().unwrap();
        let counter_path = tmp.path().join("invocations.log");
        let installer = write_counting_installer(tmp.path(), &counter_path);

        let mut config = Config::from_env();
        config.cache_dir = tmp.path().join("cache");
        config.installer_bin = installer.to_string_lossy().into_owned();
        let cache = Arc::new(EnvironmentCache::new(&config));
        let deps = DependencySet::new(vec!["numpy".to_string()]);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let deps = deps.clone();
                tokio::spawn(async move { cache.ensure(&deps).await })
            })
            .collect();
        for task in tasks {
            let env = task.await.unwrap().unwrap();
            assert_eq!(env.path, config.cache_dir.join(deps.fingerprint()));
        }

        let invocations = std::fs::read_to_string(&counter_path).unwrap_or_default();
        assert_eq!(
            invocations.lines().count(),
            1,
            "installer ran more than once: {invocations:?}"
        );
    }
}
