//! Job and dependency-set data model.

use sha2::{Digest, Sha256};

/// Reserved fingerprint for the empty dependency list: sixteen zero
/// characters, reusing the agent's own pre-built interpreter tree without
/// invoking the installer.
pub const EMPTY_DEPENDENCY_FINGERPRINT: &str = "0000000000000000";

/// The pair (sorted dependency list, fingerprint). Two dependency lists with
/// identical sorted multisets collide intentionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySet {
    sorted: Vec<String>,
    fingerprint: String,
}

impl DependencySet {
    /// Builds a canonical `DependencySet` from an arbitrary-order dependency
    /// list, sorting it and computing its fingerprint.
    pub fn new(mut dependencies: Vec<String>) -> Self {
        dependencies.sort();
        let fingerprint = fingerprint_of(&dependencies);
        DependencySet {
            sorted: dependencies,
            fingerprint,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.sorted
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// 16-hex-character canonical fingerprint: the first 64 bits of SHA-256 over
/// the comma-joined sorted dependency list, or the reserved sentinel for the
/// empty list.
fn fingerprint_of(sorted: &[String]) -> String {
    if sorted.is_empty() {
        return EMPTY_DEPENDENCY_FINGERPRINT.to_string();
    }
    let joined = sorted.join(",");
    let digest = Sha256::digest(joined.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// A unit of work received by the dispatcher. Immutable after arrival;
/// lifetime is one dispatch.
#[derive(Debug, Clone)]
pub struct Job {
    pub procedure: Vec<u8>,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    pub dependencies: DependencySet,
    pub timeout_sec: u64,
    pub memory_mb: u64,
    pub cpus: u32,
}
