//! Per-device driver configuration.
//!
//! One `DriverConfig` applies to one physical device entry and is
//! consumed at attach time; identity overrides are applied after the
//! device has been interrogated, so they always win.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default block size for image reads.
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
/// Smallest usable read block.
pub const MIN_BUFFER_SIZE: usize = 4096;
/// Largest accepted duplex offset, 1/1200 inch.
pub const MAX_DUPLEX_OFFSET: u32 = 1200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Image read block size in bytes.
    pub buffer_size: usize,
    /// Device pads inbound data/status with a framing header.
    pub padded_read: bool,
    /// Device sends an extra status trailer with a residual hint.
    pub extra_status: bool,
    /// Front/back sensor offset, 1/1200 inch.
    pub duplex_offset: u32,
    /// Identity overrides; set all three to skip INQUIRY.
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            padded_read: false,
            extra_status: false,
            duplex_offset: 0,
            vendor: None,
            model: None,
            version: None,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        Ok(config.sanitized())
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Clamp out-of-range values back to usable ones.
    pub fn sanitized(mut self) -> Self {
        if self.buffer_size < MIN_BUFFER_SIZE {
            warn!(
                buffer_size = self.buffer_size,
                min = MIN_BUFFER_SIZE,
                "buffer-size too small, using default"
            );
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.duplex_offset > MAX_DUPLEX_OFFSET {
            warn!(
                duplex_offset = self.duplex_offset,
                max = MAX_DUPLEX_OFFSET,
                "duplex-offset out of range, ignoring"
            );
            self.duplex_offset = 0;
        }
        self
    }

    /// True when the config supplies the full identity, making the
    /// INQUIRY identity pass unnecessary.
    pub fn overrides_identity(&self) -> bool {
        self.vendor.is_some() && self.model.is_some() && self.version.is_some()
    }
}
