use std::path::PathBuf;

/// Process-wide configuration, read once at startup from the environment
/// (§6) and threaded explicitly through the registry, pool, and dispatcher
/// constructors rather than kept as a hidden global.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target workers per pool (`POOL_SIZE`, default 5).
    pub pool_size: usize,
    /// Root of the environment cache (`CACHE_DIR`).
    pub cache_dir: PathBuf,
    /// TCP port for the dispatcher (`AGENT_PORT`, default 9000).
    pub agent_port: u16,
    /// Probe deadline in seconds (`WORKER_STARTUP_TIMEOUT_SEC`, default 30).
    pub worker_startup_timeout_sec: u64,
    /// Dispatcher retry cap (`MAX_RETRIES`, default 2, R in §4.5).
    pub max_retries: u32,
    /// Path to the nsjail binary. Overridable for environments where it
    /// lives outside PATH.
    pub nsjail_bin: PathBuf,
    /// Package installer command used to populate a PreparedEnvironment
    /// (default `pip`).
    pub installer_bin: String,
    /// When set, a missing `nsjail` binary degrades to a logged warning and
    /// direct process exec instead of a hard failure. Intended for local
    /// development and CI hosts without namespace support; never set this
    /// in production (`NSJAIL_OPTIONAL=1`).
    pub allow_missing_nsjail: bool,
    /// When set, workers share the host's network namespace instead of
    /// getting a fresh, unconnected one. Untrusted procedure execution (§1:
    /// "kernel-level isolation (mount/PID/user/network/UTS namespaces...)")
    /// isolates the network by default; this is an explicit opt-out, not the
    /// default (`WORKER_NETWORK_ALLOWED=1`).
    pub allow_worker_network: bool,
}

impl Config {
    /// Reads configuration from the environment, matching the teacher's own
    /// `std::env::var(...).unwrap_or_else(...)` style (no config-file
    /// format, environment variables only).
    pub fn from_env() -> Self {
        Config {
            pool_size: env_parsed("POOL_SIZE", 5),
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("sandbox-agent-cache")),
            agent_port: env_parsed("AGENT_PORT", 9000),
            worker_startup_timeout_sec: env_parsed("WORKER_STARTUP_TIMEOUT_SEC", 30),
            max_retries: env_parsed("MAX_RETRIES", 2),
            nsjail_bin: std::env::var("NSJAIL_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("nsjail")),
            installer_bin: std::env::var("INSTALLER_BIN").unwrap_or_else(|_| "pip".to_string()),
            allow_missing_nsjail: std::env::var("NSJAIL_OPTIONAL")
                .map(|v| v == "1")
                .unwrap_or(false),
            allow_worker_network: std::env::var("WORKER_NETWORK_ALLOWED")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
