//! Reconciliation primitives for idempotent container apply.
//!
//! Every deployable unit is described by a desired spec. The deployer
//! observes what is currently running under the same name and asks this
//! library what to do about it. Key concepts:
//!
//! - **Desired spec**: the container configuration computed for this run.
//! - **Observed container**: what the runtime reports under that name, if anything.
//! - **Apply action**: the single mutation (or none) that converges the two.
//!
//! # Invariants
//!
//! - Planning is a pure function of its inputs
//! - Equal specs always hash equally, independent of JSON key order
//! - An unchanged desired spec never plans a create or remove

use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a container's configuration has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Rehydrate a hash previously recorded alongside a container.
    ///
    /// Returns `None` for strings that were not produced by [`SpecHash::from_json`].
    pub fn parse(recorded: &str) -> Option<Self> {
        let digest = recorded.strip_prefix("sha256:")?;
        if digest.len() != 32 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(recorded.to_ascii_lowercase()))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// How a container is expected to behave once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Long-running service; a stopped container must be started again.
    Service,

    /// Runs to completion; an exited container is the converged state.
    OneShot,
}

/// What the runtime currently reports for a container name.
#[derive(Debug, Clone, Copy)]
pub struct Observed<'a> {
    /// Hash of the spec the container was created from.
    pub spec_hash: &'a SpecHash,

    /// Whether the container process is currently running.
    pub running: bool,
}

/// The single step that converges an observed container to its desired spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    /// Current matches desired; leave it untouched.
    Noop,

    /// Current matches desired but is stopped; start it in place.
    Start,

    /// Nothing exists under this name; create and start it.
    Create,

    /// Something exists with a different spec; remove it and create anew.
    Recreate,
}

impl ApplyAction {
    /// Returns true if the action creates or removes a container.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create | Self::Recreate)
    }
}

impl std::fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Noop => "noop",
            Self::Start => "start",
            Self::Create => "create",
            Self::Recreate => "recreate",
        };
        f.write_str(s)
    }
}

/// Decide how to converge a single named container.
pub fn plan_apply(
    desired: &SpecHash,
    lifecycle: Lifecycle,
    current: Option<Observed<'_>>,
) -> ApplyAction {
    let Some(current) = current else {
        return ApplyAction::Create;
    };

    if current.spec_hash != desired {
        return ApplyAction::Recreate;
    }

    match (lifecycle, current.running) {
        (Lifecycle::Service, false) => ApplyAction::Start,
        _ => ApplyAction::Noop,
    }
}
