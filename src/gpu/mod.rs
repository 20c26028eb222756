//! GPU device access.
//!
//! - [`device`]: GPU device discovery and info
//! - [`allocator`]: per-device address-space accounting for simulated memory
//! - [`driver`]: the [`GpuDriver`] seam and its host-memory simulation

pub mod allocator;
pub mod device;
pub mod driver;

pub use driver::{DevicePtr, GpuDriver, IpcMemHandle, ProgramId, SimulatedDriver};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("out of GPU memory on device {device_id}: requested {requested} bytes")]
    OutOfMemory { device_id: usize, requested: usize },

    #[error("device pointer {ptr:#x} is not allocated on device {device_id}")]
    InvalidPointer { device_id: usize, ptr: DevicePtr },

    #[error("device {0} not initialized")]
    DeviceNotInitialized(usize),

    #[error("invalid or already released IPC memory handle")]
    InvalidHandle,

    #[error("copy of {len} bytes overruns the {capacity}-byte allocation at {ptr:#x}")]
    CopyOverrun {
        ptr: DevicePtr,
        len: usize,
        capacity: usize,
    },

    #[error("driver error: {0}")]
    Driver(String),
}
