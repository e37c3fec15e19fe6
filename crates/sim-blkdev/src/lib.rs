//! Simulated block device for exercising the crypt target.
//!
//! A [`SimDisk`] stores sectors in RAM or in a plain file and implements
//! [`common::BlockDevice`], so the target can be driven end to end without
//! real hardware.
//!
//! # Design Philosophy
//!
//! - **Completion context**: bios complete either inside `submit` or on a
//!   dedicated thread, covering both orders a real device may produce
//! - **Fault Injection**: fail the next N bios, or every bio touching a range
//! - **Counters**: per-direction bio and sector counts for assertions
//!
//! # Example
//!
//! ```no_run
//! use sim_blkdev::{start_sim_disk, SimDiskConfig};
//!
//! let disk = start_sim_disk(SimDiskConfig {
//!     name: "sim0".into(),
//!     capacity_sectors: 1000,
//!     ..SimDiskConfig::default()
//! }).unwrap();
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use common::{BlockDevice, DeviceRegistry};
use tracing::info;

mod backing;
pub mod disk;
pub mod error;
pub mod fault;

pub use backing::MEMORY_BACKING;
pub use disk::{CompletionMode, DiskStats, SimDisk, SimDiskConfig};
pub use error::BlockDeviceError;
pub use fault::FaultPlan;

/// Start a simulated disk from `config`.
pub fn start_sim_disk(config: SimDiskConfig) -> Result<Arc<SimDisk>> {
    info!(?config, "Starting simulated disk");
    let name = config.name.clone();
    let disk = SimDisk::new(config).with_context(|| format!("failed to start disk {name}"))?;
    Ok(Arc::new(disk))
}

/// Start a disk and register it under its name.
pub fn start_registered(registry: &DeviceRegistry, config: SimDiskConfig) -> Result<Arc<SimDisk>> {
    let disk = start_sim_disk(config)?;
    registry.register(Arc::clone(&disk) as Arc<dyn BlockDevice>);
    Ok(disk)
}
