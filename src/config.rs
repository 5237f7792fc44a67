//! TOML-backed settings for master and mirror processes.

use std::io;
use std::path::Path;

use serde::Deserialize;

/// Top-level process settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub cache: CacheSettings,
    pub content: ContentSettings,
}

/// Attribute-cache tuning.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Run the full invariant scan after every mutation.
    pub paranoia: bool,
}

/// Blob residency limits for a mirror.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentSettings {
    /// Largest file kept fully resident in memory.
    pub mem_max_bytes: u64,
    /// Total budget for resident file contents.
    pub resident_capacity_bytes: u64,
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self { mem_max_bytes: 1 << 20, resident_capacity_bytes: 256 << 20 }
    }
}

impl Settings {
    /// Reads settings from a TOML file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
