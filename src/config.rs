//! Runtime configuration for gpustore.
//!
//! Capacity settings size the shared region once at startup and cannot be
//! changed without rebuilding it. Per-table and per-column options are
//! validated once, when a table is defined, into typed values.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpustore", about = "GPU context pool and chunk store exerciser")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "gpustore.json")]
    pub config: PathBuf,

    /// Number of rows to bulk-load into the demo table.
    #[arg(long, default_value_t = 100_000)]
    pub rows: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared context pool sizing.
    pub pool: PoolConfig,

    /// Chunk registry sizing.
    pub store: StoreConfig,

    /// GPU devices and device-side settings.
    pub devices: DeviceConfig,
}

/// Sizing of the shared context pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent client connections of the host.
    pub max_connections: usize,

    /// Maximum background worker processes of the host.
    pub max_worker_processes: usize,

    /// Extra shared contexts on top of connections and workers.
    pub headroom: usize,

    /// Explicit number of shared contexts; never below the derived minimum.
    pub num_gpu_contexts: Option<usize>,

    /// Upper bound of live resource-tracker nodes per process.
    pub max_tracked_resources: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_worker_processes: 8,
            headroom: 100,
            num_gpu_contexts: None,
            max_tracked_resources: 1 << 20,
        }
    }
}

impl PoolConfig {
    /// Number of shared context slots to preallocate.
    pub fn num_contexts(&self) -> usize {
        let minimum = self.max_connections + self.max_worker_processes + self.headroom;
        self.num_gpu_contexts.map_or(minimum, |n| n.max(minimum))
    }
}

/// Sizing of the chunk registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of preallocated chunk slots (at least 1).
    pub max_relations: usize,

    /// Initial row capacity of the bulk-insert staging area.
    pub initial_rows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_relations: 100,
            initial_rows: 10_000,
        }
    }
}

/// One simulated GPU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub id: usize,
    pub name: String,
    pub total_vram: usize,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Devices to simulate when no CUDA driver is compiled in.
    pub simulated: Vec<SimulatedDevice>,

    /// zstd level for columns with `compression = zstd` (1-22).
    pub zstd_level: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            simulated: vec![
                SimulatedDevice {
                    id: 0,
                    name: "Simulated GPU 0".to_string(),
                    total_vram: 8 * 1024 * 1024 * 1024, // 8 GB
                },
                SimulatedDevice {
                    id: 1,
                    name: "Simulated GPU 1".to_string(),
                    total_vram: 8 * 1024 * 1024 * 1024,
                },
            ],
            zstd_level: 1,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the shared region cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.store.max_relations == 0 {
            return Err(StoreError::InvalidOption(
                "store.max_relations must be at least 1".to_string(),
            ));
        }
        if self.pool.num_contexts() == 0 {
            return Err(StoreError::InvalidOption(
                "pool must hold at least one GPU context".to_string(),
            ));
        }
        if !(1..=22).contains(&self.devices.zstd_level) {
            return Err(StoreError::InvalidOption(format!(
                "devices.zstd_level {} is out of range 1-22",
                self.devices.zstd_level
            )));
        }
        Ok(())
    }
}

/// Where a table's chunks live besides host shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pinning {
    Unpinned,
    /// Resident in the memory of this GPU device.
    Device(usize),
}

impl Pinning {
    pub fn device(&self) -> Option<usize> {
        match self {
            Pinning::Unpinned => None,
            Pinning::Device(d) => Some(*d),
        }
    }
}

/// On-segment format of a chunk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageFormat {
    PgStrom,
}

impl StorageFormat {
    pub fn name(&self) -> &'static str {
        match self {
            StorageFormat::PgStrom => "pgstrom",
        }
    }
}

/// Per-column compression of the value area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd,
}

/// Validated per-table options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    pub pinning: Pinning,
    pub format: StorageFormat,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            pinning: Pinning::Unpinned,
            format: StorageFormat::PgStrom,
        }
    }
}

impl TableOptions {
    /// Validate host option strings (`pinning`, `format`) once.
    ///
    /// `pinning` is required: a device index below `device_count`, or
    /// `unpinned`.
    pub fn from_options(options: &[(&str, &str)], device_count: usize) -> Result<Self> {
        let mut pinning = None;
        let mut format = None;

        for &(name, value) in options {
            match name {
                "pinning" => {
                    if pinning.is_some() {
                        return Err(StoreError::InvalidOption(
                            "\"pinning\" option appears twice".to_string(),
                        ));
                    }
                    let value = value.trim();
                    if value.eq_ignore_ascii_case("unpinned") {
                        pinning = Some(Pinning::Unpinned);
                        continue;
                    }
                    let device: usize = value.parse().map_err(|_| {
                        StoreError::InvalidOption(format!("\"pinning\" is not a device index: {value}"))
                    })?;
                    if device >= device_count {
                        return Err(StoreError::InvalidOption(format!(
                            "\"pinning\" on unavailable GPU device {device}"
                        )));
                    }
                    pinning = Some(Pinning::Device(device));
                }
                "format" => {
                    if format.is_some() {
                        return Err(StoreError::InvalidOption(
                            "\"format\" option appears twice".to_string(),
                        ));
                    }
                    format = match value {
                        "pgstrom" | "default" => Some(StorageFormat::PgStrom),
                        other => {
                            return Err(StoreError::InvalidOption(format!(
                                "format \"{other}\" is unknown"
                            )))
                        }
                    };
                }
                other => {
                    return Err(StoreError::InvalidOption(format!("unknown option \"{other}\"")));
                }
            }
        }

        let pinning = pinning.ok_or_else(|| {
            StoreError::InvalidOption("no pinning GPU device given".to_string())
        })?;
        Ok(Self {
            pinning,
            format: format.unwrap_or(StorageFormat::PgStrom),
        })
    }
}

/// Validated per-column options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOptions {
    pub compression: Compression,
}

impl Default for ColumnOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
        }
    }
}

impl ColumnOptions {
    pub fn from_options(options: &[(&str, &str)]) -> Result<Self> {
        let mut compression = None;

        for &(name, value) in options {
            if name != "compression" {
                return Err(StoreError::InvalidOption(format!("unknown option \"{name}\"")));
            }
            if compression.is_some() {
                return Err(StoreError::InvalidOption(
                    "\"compression\" option appears twice".to_string(),
                ));
            }
            compression = if value.eq_ignore_ascii_case("none") {
                Some(Compression::None)
            } else if value.eq_ignore_ascii_case("zstd") {
                Some(Compression::Zstd)
            } else {
                return Err(StoreError::InvalidOption(format!(
                    "unknown compression logic: {value}"
                )));
            };
        }

        Ok(Self {
            compression: compression.unwrap_or(Compression::None),
        })
    }
}
