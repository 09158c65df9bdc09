//! Engine configuration, loaded from a small TOML file.
//!
//! The teacher crate takes all of its knobs from `clap` argv (it's a
//! one-shot CLI). This engine is meant to live inside a long-running
//! updater daemon, so the equivalent ambient concern is a config file
//! rather than argv — the same "serde-derived struct, `toml::from_str`"
//! shape used for config structs across the retrieval pack.

use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_major_versions() -> Vec<u64> {
    crate::constants::SUPPORTED_MAJOR_VERSIONS.to_vec()
}

fn default_minor_versions() -> Vec<u32> {
    crate::constants::SUPPORTED_MINOR_VERSIONS.to_vec()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Root directory for the file-backed preference store (C1).
    pub preference_store_root: PathBuf,

    /// PEM or raw public keys accepted for metadata/payload signature
    /// verification. Empty means "no key configured" (spec §4.2 rule 3).
    #[serde(default)]
    pub public_keys: Vec<PathBuf>,

    /// Whether a missing signature is fatal. Official builds must set this;
    /// engineering/dev builds may flip it off.
    #[serde(default = "default_true")]
    pub require_signatures: bool,

    #[serde(default = "default_major_versions")]
    pub supported_major_versions: Vec<u64>,

    #[serde(default = "default_minor_versions")]
    pub supported_minor_versions: Vec<u32>,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let cfg: EngineConfig = toml::from_str(text)?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn accepts_major_version(&self, version: u64) -> bool {
        self.supported_major_versions.contains(&version)
    }

    pub fn accepts_minor_version(&self, version: u32) -> bool {
        self.supported_minor_versions.contains(&version)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preference_store_root: PathBuf::from("/var/lib/ab_update_engine/prefs"),
            public_keys: Vec::new(),
            require_signatures: true,
            supported_major_versions: default_major_versions(),
            supported_minor_versions: default_minor_versions(),
        }
    }
}
