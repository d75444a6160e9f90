//! Configuration types for flexalloc
//!
//! This module defines configuration structures used by the I/O tools.
//! Every section has defaults, so a partial TOML file is accepted.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hard cap on the number of stripe members a single transfer may use
pub const MAX_STRIPE_WIDTH: u32 = 512;

/// Largest chunk in blocks; per-command block counts are 16-bit, zero-based
pub const MAX_CHUNK_NLBS: u64 = 1 << 16;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing device configuration
    pub device: DeviceConfig,
    /// Stripe layout used by the striped paths
    pub stripe: StripeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check the configuration for values the I/O layer would reject
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.stripe.validate(&self.device)?;
        Ok(())
    }
}

/// Configuration for a file-backed device
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path to the backing file or block device
    pub path: PathBuf,
    /// Capacity in bytes (ignored for block devices)
    pub size: u64,
    /// Logical block size in bytes
    pub lba_nbytes: u32,
    /// Maximum data transfer per command in bytes
    pub mdts_nbytes: u32,
    /// Use direct I/O (O_DIRECT on Linux, F_NOCACHE on macOS)
    pub direct_io: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./flexalloc.img"),
            size: 1024 * 1024 * 1024, // 1 GB
            lba_nbytes: 4096,
            mdts_nbytes: 128 * 1024, // 128 KB
            direct_io: false,
        }
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        if self.lba_nbytes == 0 || !self.lba_nbytes.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block size {} is not a power of two",
                self.lba_nbytes
            )));
        }
        if self.mdts_nbytes < self.lba_nbytes {
            return Err(Error::configuration(format!(
                "mdts {} is smaller than the block size {}",
                self.mdts_nbytes, self.lba_nbytes
            )));
        }
        if self.size == 0 || self.size % u64::from(self.lba_nbytes) != 0 {
            return Err(Error::configuration(format!(
                "device size {} is not a non-zero multiple of {}",
                self.size, self.lba_nbytes
            )));
        }
        Ok(())
    }
}

/// Stripe layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StripeConfig {
    /// Number of stripe members
    pub width: u32,
    /// Bytes written to one member before moving to the next
    pub chunk_nbytes: u64,
    /// Capacity of each member in blocks
    pub obj_nlbs: u64,
    /// Device byte offset where the first member starts
    pub obj_start_nbytes: u64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            width: 4,
            chunk_nbytes: 64 * 1024, // 64 KB
            obj_nlbs: 1024,
            obj_start_nbytes: 0,
        }
    }
}

impl StripeConfig {
    fn validate(&self, device: &DeviceConfig) -> Result<()> {
        if self.width == 0 || self.width > MAX_STRIPE_WIDTH {
            return Err(Error::configuration(format!(
                "stripe width {} outside 1..={MAX_STRIPE_WIDTH}",
                self.width
            )));
        }
        let lba = u64::from(device.lba_nbytes);
        if self.chunk_nbytes == 0 || self.chunk_nbytes % lba != 0 {
            return Err(Error::configuration(format!(
                "chunk size {} is not a non-zero multiple of {lba}",
                self.chunk_nbytes
            )));
        }
        if self.chunk_nbytes / lba > MAX_CHUNK_NLBS {
            return Err(Error::configuration(format!(
                "chunk of {} blocks exceeds the per-command limit of {MAX_CHUNK_NLBS}",
                self.chunk_nbytes / lba
            )));
        }
        let obj_nbytes = self.obj_nlbs.checked_mul(lba);
        if !obj_nbytes.is_some_and(|n| n > 0 && n % self.chunk_nbytes == 0) {
            return Err(Error::configuration(format!(
                "member capacity of {} blocks is not a non-zero multiple of the {}-byte chunk",
                self.obj_nlbs, self.chunk_nbytes
            )));
        }
        if self.obj_start_nbytes % lba != 0 {
            return Err(Error::configuration(format!(
                "member start offset {} is not a multiple of {lba}",
                self.obj_start_nbytes
            )));
        }
        let stripe_end = u64::from(self.width)
            .checked_mul(self.obj_nlbs)
            .and_then(|nlbs| nlbs.checked_mul(lba))
            .and_then(|nbytes| nbytes.checked_add(self.obj_start_nbytes));
        match stripe_end {
            Some(end) if end <= device.size => Ok(()),
            _ => Err(Error::configuration(format!(
                "stripe of {} x {} blocks at {} exceeds device size {}",
                self.width, self.obj_nlbs, self.obj_start_nbytes, device.size
            ))),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
