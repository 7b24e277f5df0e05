//! Runtime configuration
//!
//! Loaded from JSON; every field has a default, so `{}` is a valid config.
//!
//! ```json
//! {
//!   "app_root": "./data",
//!   "event_ring_exp": 16,
//!   "memory": { "initial_bytes": 1048576, "reserved_bytes": 67108864 },
//!   "window_size": { "width": 1280, "height": 720 }
//! }
//! ```

use crate::error::ConfigError;
use crate::events::MIN_CHANNEL_EXP;
use crate::events::ring::MAX_CAPACITY_EXP;
use crate::sandbox::PAGE_SIZE;
use crate::sandbox::memory::MAX_GUEST_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Committed bytes at start
    pub initial_bytes: u64,
    /// Upper bound for `mem_grow`
    pub reserved_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_bytes: 16 * PAGE_SIZE,
            reserved_bytes: 64 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sandbox root; guest paths resolve below it
    pub app_root: PathBuf,
    /// Event ring capacity is `2^event_ring_exp` bytes
    pub event_ring_exp: u32,
    pub max_capabilities: usize,
    pub memory: MemoryConfig,
    /// Guest log entries kept by the console
    pub console_capacity: usize,
    pub frame_interval_ms: u64,
    /// Pause before `on_init`
    pub break_on_start: bool,
    /// Size reported by the initial `on_resize`
    pub window_size: WindowSize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_root: PathBuf::from("."),
            event_ring_exp: 16,
            max_capabilities: crate::sandbox::capability::DEFAULT_CAPACITY,
            memory: MemoryConfig::default(),
            console_capacity: 512,
            frame_interval_ms: 16,
            break_on_start: false,
            window_size: WindowSize::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Smaller rings cannot hold a single event header
        if !(MIN_CHANNEL_EXP..=MAX_CAPACITY_EXP).contains(&self.event_ring_exp) {
            return Err(invalid(
                "event_ring_exp",
                format!("must be in {MIN_CHANNEL_EXP}..={MAX_CAPACITY_EXP}"),
            ));
        }
        // One slot goes to the root directory
        if self.max_capabilities < 2 || self.max_capabilities > u32::MAX as usize {
            return Err(invalid("max_capabilities", "must be at least 2 and fit in 32 bits"));
        }

        let MemoryConfig {
            initial_bytes,
            reserved_bytes,
        } = self.memory;
        if initial_bytes % PAGE_SIZE != 0 || reserved_bytes % PAGE_SIZE != 0 {
            return Err(invalid("memory", format!("sizes must be multiples of {PAGE_SIZE}")));
        }
        if reserved_bytes > MAX_GUEST_BYTES {
            return Err(invalid("memory.reserved_bytes", "exceeds 4 GiB"));
        }
        if initial_bytes > reserved_bytes {
            return Err(invalid("memory.initial_bytes", "exceeds reserved_bytes"));
        }

        if self.frame_interval_ms == 0 {
            return Err(invalid("frame_interval_ms", "must be non-zero"));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
