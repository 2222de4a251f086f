//! Worker handle (C2): spawns one worker under nsjail, probes it to
//! Ready, performs framed RPC with a deadline, detects death, and shuts
//! down. State machine is a hand-rolled enum `match`, following the
//! teacher's own `state.rs::ExecutionFlow` rather than a state-machine
//! crate (see DESIGN.md on why `statig` is not used here).

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::procedure::Procedure;
use crate::protocol::{self, RpcReply, RpcRequest};

/// Worker lifecycle states (spec.md §4.2). Transitions are one-way out of
/// `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Dead,
}

pub struct WorkerHandle {
    id: u64,
    pid: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    state: WorkerState,
}

impl WorkerHandle {
    /// Spawns a worker for `environment_path` and blocks until it probes
    /// Ready or the startup budget (`config.worker_startup_timeout_sec`)
    /// elapses. A probe failure leaves no live handle behind: the child is
    /// killed and reaped before the error is returned (spec.md §4.2:
    /// "failure to reach Ready transitions the handle to Dead").
    pub async fn spawn(
        id: u64,
        config: &Config,
        environment_path: &Path,
        worker_bin: &Path,
        memory_mb: u64,
        cpus: u32,
    ) -> Result<Self> {
        let mut command = crate::nsjail::worker_command(config, environment_path, worker_bin, memory_mb, cpus, id)
            .await
            .map_err(|e| AgentError::AgentInternal(e.to_string()))?;
        let mut child = command
            .spawn()
            .map_err(|e| AgentError::AgentInternal(format!("failed to spawn worker: {e}")))?;
        let pid = child.id().ok_or_else(|| AgentError::AgentInternal("worker exited before pid was observed".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::AgentInternal("worker child missing stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::AgentInternal("worker child missing stdout".to_string()))?;

        let mut handle = WorkerHandle {
            id,
            pid,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            state: WorkerState::Spawning,
        };

        let probe_budget = Duration::from_secs(config.worker_startup_timeout_sec);
        match timeout(probe_budget, handle.probe()).await {
            Ok(Ok(())) => {
                handle.state = WorkerState::Ready;
                info!(worker_id = id, pid, "worker reached Ready");
                Ok(handle)
            }
            Ok(Err(e)) => {
                warn!(worker_id = id, pid, error = %e, "worker probe failed");
                handle.state = WorkerState::Dead;
                handle.shutdown().await;
                Err(AgentError::WorkerDied(format!("probe failed: {e}")))
            }
            Err(_) => {
                warn!(worker_id = id, pid, "worker probe timed out");
                handle.state = WorkerState::Dead;
                handle.shutdown().await;
                Err(AgentError::WorkerDied("probe timed out".to_string()))
            }
        }
    }

    async fn probe(&mut self) -> Result<()> {
        let noop = Procedure::Return { value: Vec::new() };
        let request = RpcRequest {
            procedure: protocol::encode_stdio(&noop)?,
            args: Vec::new(),
            kwargs: Vec::new(),
        };
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Performs exactly one RPC, enforced by the pool's busy bookkeeping
    /// (§4.3) rather than internal locking here — a handle is only ever
    /// reachable from one caller at a time while acquired. `deadline` is the
    /// job timeout plus the small epsilon spec.md §4.2 calls for.
    pub async fn execute(&mut self, request: RpcRequest, deadline: Duration) -> Result<RpcReply> {
        self.state = WorkerState::Busy;
        let result = timeout(deadline, self.roundtrip(&request)).await;
        match result {
            Ok(Ok(reply)) => {
                self.state = WorkerState::Ready;
                Ok(reply)
            }
            Ok(Err(e)) => {
                self.state = WorkerState::Dead;
                Err(e)
            }
            Err(_) => {
                self.state = WorkerState::Dead;
                Err(AgentError::Timeout(format!(
                    "procedure exceeded {}s",
                    deadline.as_secs()
                )))
            }
        }
    }

    async fn roundtrip(&mut self, request: &RpcRequest) -> Result<RpcReply> {
        let payload = protocol::encode_stdio(request)?;
        protocol::write_frame(&mut self.stdin, &payload).await.map_err(|e| {
            AgentError::WorkerDied(format!("write failed: {e}"))
        })?;
        let frame = protocol::read_frame(&mut self.stdout)
            .await
            .map_err(|e| AgentError::WorkerDied(format!("read failed: {e}")))?
            .ok_or_else(|| AgentError::WorkerDied("worker closed stdout".to_string()))?;
        // A reply frame that fails to decode is frame corruption (§4.2), the
        // same retryable-worker-death class as a short read or I/O error —
        // not a caller-facing `BadRequest` (that kind is reserved for the
        // dispatcher's own inbound envelope decoding in `dispatcher.rs`).
        protocol::decode_stdio(&frame).map_err(|e| AgentError::WorkerDied(format!("corrupt reply frame: {e}")))
    }

    /// Closes stdin, waits briefly for voluntary exit, escalates to
    /// terminate then kill, and reaps the child. Idempotent: a handle
    /// already `Dead` with a reaped child is a no-op.
    pub async fn shutdown(&mut self) {
        let _ = self.stdin.shutdown().await;

        if timeout(Duration::from_secs(1), self.child.wait()).await.is_ok() {
            self.state = WorkerState::Dead;
            return;
        }

        self.signal(nix::sys::signal::Signal::SIGTERM);
        if timeout(Duration::from_secs(1), self.child.wait()).await.is_err() {
            self.signal(nix::sys::signal::Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
        self.state = WorkerState::Dead;
    }

    fn signal(&self, signal: nix::sys::signal::Signal) {
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, signal) {
            warn!(worker_id = self.id, pid = self.pid, %signal, error = %e, "failed to signal worker");
        }
    }
}
