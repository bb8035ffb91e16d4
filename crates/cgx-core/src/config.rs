//! Configuration for the cellgx command processor
//!
//! The spin-wait polling interval and the driver recovery timeout are
//! environment tunables on real systems; neither value is load-bearing
//! for correctness, only for liveness, so both live here instead of in
//! the processor itself.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub processor: ProcessorConfig,
    pub memory: MemoryConfig,
}

/// Command processor tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Interval between re-checks of a watched semaphore while spinning
    pub semaphore_poll_interval_us: u64,
    /// Give up on a semaphore wait after this long (misbehaving producer)
    pub driver_recovery_timeout_us: u64,
    /// Settle delay applied when an acquire is satisfied on first check
    pub fifo_wake_delay_us: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            semaphore_poll_interval_us: 100,
            driver_recovery_timeout_us: 1_000_000,
            fifo_wake_delay_us: 200,
        }
    }
}

/// Guest memory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total size of the modeled guest-visible memory in KiB
    pub size_kib: u32,
    /// Base address of local (VRAM) memory
    pub local_base: u32,
    /// Base address of the semaphore/label block
    pub label_base: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size_kib: 512,
            local_base: 0,
            label_base: 0x4_0000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults if
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
