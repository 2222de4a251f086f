//! Warm execution-pool dispatcher: spawns and supervises nsjail-isolated
//! worker processes per dependency set, routes jobs to them over a
//! length-prefixed stdio RPC, and exposes an HTTP front-end with retry on
//! transient worker failure.

pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod job;
pub mod nsjail;
pub mod pool;
pub mod procedure;
pub mod protocol;
pub mod registry;
pub mod worker_handle;

use sha2::{Digest, Sha256};

/// Computes the `/version` fingerprint: the first 16 hex characters of a
/// SHA-256 over `CARGO_PKG_VERSION` plus an optional
/// `AGENT_BUILD_ID` override, so operators can force clients to detect an
/// upgrade by bumping the build id without a version bump.
pub fn version_fingerprint() -> String {
    let build_id = std::env::var("AGENT_BUILD_ID").unwrap_or_default();
    let source = format!("{}{}", env!("CARGO_PKG_VERSION"), build_id);
    let digest = Sha256::digest(source.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_fingerprint_is_sixteen_hex_chars() {
        let fp = version_fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
