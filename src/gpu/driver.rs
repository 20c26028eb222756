//! The GPU driver seam.
//!
//! The store only acquires and releases device memory, IPC handles and
//! compiled programs; kernels never run here. [`SimulatedDriver`] keeps
//! device memory in host buffers so the whole stack runs without hardware.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use super::allocator::VramAllocator;
use super::device::GpuDeviceInfo;
use super::DeviceError;

/// Device virtual address.
pub type DevicePtr = u64;

/// Identifier of a compiled GPU program.
pub type ProgramId = u64;

/// Size of a raw device-memory IPC handle.
pub const IPC_HANDLE_SIZE: usize = 64;

/// Opaque device-memory IPC handle, shareable across processes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IpcMemHandle([u8; IPC_HANDLE_SIZE]);

impl IpcMemHandle {
    /// The handle of an unpinned chunk.
    pub const ZERO: IpcMemHandle = IpcMemHandle([0; IPC_HANDLE_SIZE]);

    pub fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcMemHandle(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Device memory and program operations the store relies on.
pub trait GpuDriver: Send + Sync {
    /// Number of usable devices.
    fn device_count(&self) -> usize;

    /// Allocate plain device memory.
    fn mem_alloc(&self, device: usize, len: usize) -> Result<DevicePtr, DeviceError>;

    /// Allocate memory addressable from host and every device.
    fn mem_alloc_managed(&self, len: usize) -> Result<DevicePtr, DeviceError>;

    /// Free memory returned by `mem_alloc` or `mem_alloc_managed`.
    fn mem_free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Synchronous host-to-device copy.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;

    /// Allocate device memory that outlives the allocating process and can
    /// be opened by others through the returned handle.
    fn mem_alloc_preserved(&self, device: usize, len: usize) -> Result<IpcMemHandle, DeviceError>;

    /// Release memory allocated by `mem_alloc_preserved`.
    fn mem_free_preserved(&self, device: usize, handle: &IpcMemHandle) -> Result<(), DeviceError>;

    /// Map preserved memory into the caller's device context.
    fn ipc_open(&self, device: usize, handle: &IpcMemHandle) -> Result<DevicePtr, DeviceError>;

    /// Unmap a pointer returned by `ipc_open`.
    fn ipc_close(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Drop one reference on a compiled program.
    fn put_program(&self, program: ProgramId) -> Result<(), DeviceError>;
}

/// Allocation counters of the simulated driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub device_allocations: usize,
    pub managed_allocations: usize,
    pub preserved_allocations: usize,
    pub open_ipc_mappings: usize,
    pub released_programs: usize,
}

#[derive(Debug, Default)]
struct SimState {
    vram: Option<VramAllocator>,
    /// Device address -> (device, bytes). Covers plain and preserved memory.
    device_mem: HashMap<DevicePtr, (usize, Vec<u8>)>,
    /// Plain (non-preserved) device allocations.
    plain: HashMap<DevicePtr, usize>,
    managed: HashMap<DevicePtr, Vec<u8>>,
    next_managed: DevicePtr,
    preserved: HashMap<IpcMemHandle, (usize, DevicePtr)>,
    next_handle: u64,
    /// Opened IPC mapping -> underlying preserved address.
    ipc_mappings: HashMap<DevicePtr, DevicePtr>,
    next_mapping: DevicePtr,
    released_programs: Vec<ProgramId>,
}

/// Host-memory simulation of a GPU driver.
#[derive(Debug)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
    device_count: usize,
}

impl SimulatedDriver {
    pub fn new(devices: &[GpuDeviceInfo]) -> Self {
        let budgets: Vec<(usize, usize)> = devices.iter().map(|d| (d.id, d.total_vram)).collect();
        Self {
            state: Mutex::new(SimState {
                vram: Some(VramAllocator::new(&budgets)),
                next_managed: 1 << 62,
                next_mapping: 3 << 61,
                ..Default::default()
            }),
            device_count: devices.len(),
        }
    }

    /// Copy of the bytes behind a device, managed or mapped pointer.
    pub fn read_device(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let base = state.ipc_mappings.get(&ptr).copied().unwrap_or(ptr);
        state
            .device_mem
            .get(&base)
            .map(|(_, bytes)| bytes.clone())
            .or_else(|| state.managed.get(&base).cloned())
    }

    /// Bytes charged on one device.
    pub fn device_bytes(&self, device: usize) -> usize {
        self.state.lock().vram.as_ref().map_or(0, |v| v.used(device))
    }

    /// Fraction of the VRAM budget charged, per device.
    pub fn vram_utilization(&self) -> Vec<(usize, f64)> {
        self.state
            .lock()
            .vram
            .as_ref()
            .map(VramAllocator::utilization)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DriverStats {
        let state = self.state.lock();
        DriverStats {
            device_allocations: state.plain.len(),
            managed_allocations: state.managed.len(),
            preserved_allocations: state.preserved.len(),
            open_ipc_mappings: state.ipc_mappings.len(),
            released_programs: state.released_programs.len(),
        }
    }

    fn vram(state: &mut SimState) -> Result<&mut VramAllocator, DeviceError> {
        state
            .vram
            .as_mut()
            .ok_or_else(|| DeviceError::Driver("no devices".to_string()))
    }
}

impl GpuDriver for SimulatedDriver {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn mem_alloc(&self, device: usize, len: usize) -> Result<DevicePtr, DeviceError> {
        let mut state = self.state.lock();
        let ptr = Self::vram(&mut state)?.allocate(device, len)?;
        state.device_mem.insert(ptr, (device, vec![0; len]));
        state.plain.insert(ptr, device);
        Ok(ptr)
    }

    fn mem_alloc_managed(&self, len: usize) -> Result<DevicePtr, DeviceError> {
        let mut state = self.state.lock();
        let ptr = state.next_managed;
        state.next_managed += (len.max(1) as u64).div_ceil(256) * 256;
        state.managed.insert(ptr, vec![0; len]);
        debug!(ptr, len, "Allocated managed memory");
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.managed.remove(&ptr).is_some() {
            return Ok(());
        }
        let device = state
            .plain
            .remove(&ptr)
            .ok_or(DeviceError::InvalidPointer { device_id: 0, ptr })?;
        state.device_mem.remove(&ptr);
        Self::vram(&mut state)?.free(device, ptr)?;
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let base = state.ipc_mappings.get(&dst).copied().unwrap_or(dst);
        let target = if let Some(bytes) = state.managed.get_mut(&base) {
            bytes
        } else if let Some((_, bytes)) = state.device_mem.get_mut(&base) {
            bytes
        } else {
            return Err(DeviceError::InvalidPointer { device_id: 0, ptr: dst });
        };
        if src.len() > target.len() {
            return Err(DeviceError::CopyOverrun {
                ptr: dst,
                len: src.len(),
                capacity: target.len(),
            });
        }
        target[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn mem_alloc_preserved(&self, device: usize, len: usize) -> Result<IpcMemHandle, DeviceError> {
        let mut state = self.state.lock();
        let ptr = Self::vram(&mut state)?.allocate(device, len)?;
        state.device_mem.insert(ptr, (device, vec![0; len]));

        state.next_handle += 1;
        let mut raw = [0u8; IPC_HANDLE_SIZE];
        raw[..8].copy_from_slice(&state.next_handle.to_le_bytes());
        raw[8..16].copy_from_slice(&ptr.to_le_bytes());
        raw[16..24].copy_from_slice(&(device as u64).to_le_bytes());
        let handle = IpcMemHandle(raw);
        state.preserved.insert(handle, (device, ptr));
        debug!(device, ptr, len, "Allocated preserved device memory");
        Ok(handle)
    }

    fn mem_free_preserved(&self, device: usize, handle: &IpcMemHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let (owner, ptr) = state
            .preserved
            .get(handle)
            .copied()
            .ok_or(DeviceError::InvalidHandle)?;
        if owner != device {
            return Err(DeviceError::InvalidHandle);
        }
        state.preserved.remove(handle);
        state.device_mem.remove(&ptr);
        Self::vram(&mut state)?.free(device, ptr)?;
        Ok(())
    }

    fn ipc_open(&self, device: usize, handle: &IpcMemHandle) -> Result<DevicePtr, DeviceError> {
        let mut state = self.state.lock();
        let (owner, base) = state
            .preserved
            .get(handle)
            .copied()
            .ok_or(DeviceError::InvalidHandle)?;
        if owner != device {
            return Err(DeviceError::InvalidHandle);
        }
        let mapped = state.next_mapping;
        state.next_mapping += 256;
        state.ipc_mappings.insert(mapped, base);
        Ok(mapped)
    }

    fn ipc_close(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state
            .ipc_mappings
            .remove(&ptr)
            .map(|_| ())
            .ok_or(DeviceError::InvalidPointer { device_id: 0, ptr })
    }

    fn put_program(&self, program: ProgramId) -> Result<(), DeviceError> {
        self.state.lock().released_programs.push(program);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::gpu::device::simulated_devices;

    fn driver() -> SimulatedDriver {
        SimulatedDriver::new(&simulated_devices(&DeviceConfig::default()))
    }

    #[test]
    fn test_preserved_roundtrip_through_ipc() {
        let drv = driver();
        let handle = drv.mem_alloc_preserved(1, 16).unwrap();
        assert!(!handle.is_zero());

        let mapped = drv.ipc_open(1, &handle).unwrap();
        drv.memcpy_htod(mapped, b"0123456789abcdef").unwrap();
        drv.ipc_close(mapped).unwrap();

        let other = drv.ipc_open(1, &handle).unwrap();
        assert_eq!(drv.read_device(other).unwrap(), b"0123456789abcdef");
        drv.ipc_close(other).unwrap();

        assert!(drv.ipc_open(0, &handle).is_err());
        drv.mem_free_preserved(1, &handle).unwrap();
        assert_eq!(drv.device_bytes(1), 0);
        assert!(drv.mem_free_preserved(1, &handle).is_err());
    }

    #[test]
    fn test_copy_overrun() {
        let drv = driver();
        let ptr = drv.mem_alloc_managed(4).unwrap();
        assert!(matches!(
            drv.memcpy_htod(ptr, &[0u8; 8]),
            Err(DeviceError::CopyOverrun { .. })
        ));
        drv.mem_free(ptr).unwrap();
        assert_eq!(drv.stats(), DriverStats::default());
    }
}
