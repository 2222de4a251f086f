//! nsjail config and argv construction: namespace creation, a read-only
//! bind of the PreparedEnvironment, a fresh private `/tmp`, and cgroup
//! memory/CPU limits, written as the protobuf-text `--config` file nsjail
//! itself accepts. Generalized from the teacher's Landlock-only
//! `jail.rs::init_jail` graceful-degradation pattern (warn and continue
//! rather than hard-fail when the isolation primitive is unavailable) to
//! nsjail's broader namespace/cgroup surface.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::warn;

use crate::config::Config;

/// Resolves the command used to launch one worker process for
/// `environment_path`, wrapped under nsjail when available. When nsjail is
/// not on `PATH` and `config.allow_missing_nsjail` is set, falls back to a
/// direct unsandboxed exec with a logged warning — mirroring
/// `jail.rs::init_jail`'s own "Landlock restrictions disabled... continuing
/// with reduced security" behavior, but gated so production deployments
/// (where `allow_missing_nsjail` is false) still hard-fail instead of
/// silently losing isolation.
pub async fn worker_command(
    config: &Config,
    environment_path: &Path,
    worker_bin: &Path,
    memory_mb: u64,
    cpus: u32,
    worker_id: u64,
) -> Result<Command, NsjailUnavailable> {
    if nsjail_available(&config.nsjail_bin).await {
        let cfg_path = write_config_file(config, environment_path, worker_bin, memory_mb, cpus, worker_id)
            .await
            .map_err(|e| NsjailUnavailable(Some(e.to_string())))?;
        Ok(wrapped_command(config, &cfg_path))
    } else if config.allow_missing_nsjail {
        warn!(
            nsjail_bin = %config.nsjail_bin.display(),
            "nsjail not found on PATH - spawning worker without kernel isolation (dev/test only)"
        );
        Ok(direct_command(worker_bin))
    } else {
        Err(NsjailUnavailable(None))
    }
}

#[derive(Debug)]
pub struct NsjailUnavailable(Option<String>);

impl std::fmt::Display for NsjailUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(detail) => write!(f, "failed to prepare nsjail config: {detail}"),
            None => write!(f, "nsjail binary not found and allow_missing_nsjail is not set"),
        }
    }
}

impl std::error::Error for NsjailUnavailable {}

async fn nsjail_available(nsjail_bin: &Path) -> bool {
    if nsjail_bin.is_absolute() {
        return nsjail_bin.exists();
    }
    Command::new(nsjail_bin)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok()
}

fn direct_command(worker_bin: &Path) -> Command {
    let mut cmd = Command::new(worker_bin);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
    // If a handle is ever dropped without going through `WorkerHandle::shutdown`
    // (e.g. a cancelled dispatch task), the child must not outlive it.
    cmd.kill_on_drop(true);
    cmd
}

/// Builds the nsjail-wrapped command: everything namespace/cgroup/mount
/// related lives in the config file at `cfg_path` (including which binary
/// nsjail execs), so the outer argv is just `--config <path>`.
fn wrapped_command(config: &Config, cfg_path: &Path) -> Command {
    let mut cmd = Command::new(&config.nsjail_bin);
    cmd.arg("--config").arg(cfg_path);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
    // See `direct_command`: guards against orphaned nsjail children on drop.
    cmd.kill_on_drop(true);
    cmd
}

/// Writes the generated config to a scratch file scoped to this worker id
/// and returns its path. Scratch configs live under `cache_dir/.nsjail-cfg`
/// rather than a process tempdir so they survive independently of any one
/// handle's lifetime and are easy to inspect by hand while debugging a
/// running agent.
async fn write_config_file(
    config: &Config,
    environment_path: &Path,
    worker_bin: &Path,
    memory_mb: u64,
    cpus: u32,
    worker_id: u64,
) -> std::io::Result<PathBuf> {
    let dir = config.cache_dir.join(".nsjail-cfg");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("worker-{worker_id}.cfg"));
    let text = nsjail_config_text(
        environment_path,
        worker_bin,
        memory_mb,
        cpus,
        config.allow_worker_network,
    );
    tokio::fs::write(&path, text).await?;
    Ok(path)
}

/// The nsjail protobuf-text config body, separated from file I/O so tests
/// can assert on its shape without touching the filesystem or invoking a
/// real nsjail binary. Untrusted code gets a fresh, disconnected network
/// namespace by default (`clone_newnet: true`); `allow_network` is the
/// explicit opt-out (`Config.allow_worker_network`), never the default.
pub fn nsjail_config_text(
    environment_path: &Path,
    worker_bin: &Path,
    memory_mb: u64,
    cpus: u32,
    allow_network: bool,
) -> String {
    let cpu_ms_per_sec = (cpus.max(1) as u64) * 1000;
    let memory_bytes = memory_mb * 1024 * 1024;
    let clone_newnet = !allow_network;
    format!(
        r#"name: "sandbox-worker"
mode: ONCE
hostname: "sandboxed"
cwd: "/env"
keep_env: false
keep_caps: false
clone_newnet: {clone_newnet}
clone_newuser: true
clone_newns: true
clone_newpid: true
clone_newuts: true
clone_newipc: true
rlimit_as: "max"
rlimit_fsize: "max"
cgroup_mem_max: {memory_bytes}
cgroup_cpu_ms_per_sec: {cpu_ms_per_sec}
mount {{
  src: "{env_src}"
  dst: "/env"
  is_bind: true
  rw: false
}}
mount {{
  dst: "/tmp"
  fstype: "tmpfs"
  rw: true
  is_dir: true
}}
mount {{
  dst: "/dev/null"
  fstype: "none"
  src: "/dev/null"
  is_bind: true
  rw: true
}}
exec_bin {{
  path: "{worker_bin}"
}}
"#,
        env_src = environment_path.display(),
        worker_bin = worker_bin.display(),
    )
}
