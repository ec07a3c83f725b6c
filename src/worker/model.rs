use crate::error::BatchError;

/// Default model rotation: interchangeable low-cost models.
pub const DEFAULT_MODELS: [&str; 3] = [
    "claude-haiku-4-5-20251001",
    "claude-3-5-haiku-20241022",
    "claude-3-haiku-20240307",
];

/// Maps a worker identity to one model of a fixed rotation.
///
/// The mapping is a pure function of the identity so a worker keeps the same
/// model for its whole lifetime and a pool of `worker-1..worker-n` spreads
/// evenly over the rotation.
#[derive(Debug, Clone)]
pub struct ModelAssigner {
    models: Vec<String>,
}

impl ModelAssigner {
    pub fn new(models: Vec<String>) -> Result<Self, BatchError> {
        if models.is_empty() {
            return Err(BatchError::Config("model rotation must not be empty".into()));
        }
        Ok(Self { models })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Model for `identity`. Identities without a number fall back to the
    /// current process id.
    pub fn assign(&self, identity: &str) -> &str {
        self.assign_with_pid(identity, std::process::id())
    }

    /// `worker-1` maps to the first model, `worker-2` to the second, and so on,
    /// wrapping around the rotation.
    pub fn assign_with_pid(&self, identity: &str, pid: u32) -> &str {
        let len = self.models.len() as u64;
        let slot = match numeric_suffix(identity) {
            Some(n) => (n % len + len - 1) % len,
            None => u64::from(pid) % len,
        };
        &self.models[slot as usize]
    }
}

impl Default for ModelAssigner {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// The last run of ASCII digits in `identity`, e.g. `celery@worker12` → 12.
fn numeric_suffix(identity: &str) -> Option<u64> {
    let end = identity.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = identity[..end]
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    identity[start..end].parse().ok()
}
