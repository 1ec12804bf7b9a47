//! Session configuration and the decode thread policy.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SessionError};

/// Tunables for one model session.
///
/// Defaults mirror the constants the session was originally shipped with:
/// a 4096-position context, a 512-entry decode batch, and a low, fixed
/// sampling temperature with a deterministic seed. Callers wanting varied
/// output re-initialize the sampler with a different seed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Maximum number of KV-cache positions.
    pub max_context: usize,
    /// Capacity of the reusable decode batch.
    pub batch_capacity: usize,
    pub temperature: f32,
    pub seed: u64,
    /// Decode threads. `None` derives a count from the available cores.
    pub threads: Option<usize>,
    /// Name of the built-in chat template to initialize.
    pub template: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_context: 4096,
            batch_capacity: 512,
            temperature: 0.2,
            seed: 299_792_458,
            threads: None,
            template: "chatml".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
    }

    /// The thread count the decoding context will be created with.
    pub fn effective_threads(&self) -> usize {
        clamp_threads(self.threads.unwrap_or_else(num_cpus::get))
    }
}

/// Clamp a requested decode thread count to `[1, min(8, cores - 2)]`.
///
/// Two cores are held back for the submitting caller and the streaming
/// consumer; the result is never zero.
pub fn clamp_threads(requested: usize) -> usize {
    let ceiling = num_cpus::get().saturating_sub(2).min(8).max(1);
    requested.clamp(1, ceiling)
}

#[cfg(test)]
mod tests {
    use super::{clamp_threads, SessionConfig};

    #[test]
    fn defaults_match_shipped_constants() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.max_context, 4096);
        assert_eq!(cfg.batch_capacity, 512);
        assert_eq!(cfg.template, "chatml");
    }

    #[test]
    fn thread_clamp_never_yields_zero_and_respects_ceiling() {
        assert_eq!(clamp_threads(0), 1);
        assert!(clamp_threads(1) >= 1);
        assert!(clamp_threads(usize::MAX) <= 8);
    }

    #[test]
    fn config_parses_from_toml() {
        let base = std::env::temp_dir().join(format!("vlm_session_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&base).expect("create temp dir");
        let path = base.join("session.toml");
        std::fs::write(
            &path,
            "max_context = 2048\ntemperature = 0.7\ntemplate = \"vicuna\"\n",
        )
        .expect("write config");

        let cfg = SessionConfig::from_toml_file(&path).expect("parse config");
        assert_eq!(cfg.max_context, 2048);
        assert_eq!(cfg.template, "vicuna");
        // unspecified fields keep their defaults
        assert_eq!(cfg.batch_capacity, 512);

        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let err = toml::from_str::<SessionConfig>("max_contxt = 10\n");
        assert!(err.is_err());
    }
}
