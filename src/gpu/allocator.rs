//! Device memory accounting for the simulated driver.
//!
//! Each device owns a disjoint address range. Allocations are handed out
//! from a bump pointer and charged against the device's VRAM budget;
//! addresses are never reused, so a stale pointer can't alias a new block.

use std::collections::HashMap;

use tracing::debug;

use super::{DeviceError, DevicePtr};

/// Address space reserved per device.
const DEVICE_ADDRESS_SPAN: u64 = 1 << 44;

/// Alignment of every device allocation.
const DEVICE_ALIGN: u64 = 256;

/// Per-device allocator.
#[derive(Debug)]
struct DeviceAllocator {
    /// Device ID.
    device_id: usize,

    /// VRAM budget in bytes.
    capacity: usize,

    /// Bytes currently charged.
    used: usize,

    /// Next unassigned address.
    next_addr: DevicePtr,

    /// Live allocations and their sizes.
    live: HashMap<DevicePtr, usize>,
}

impl DeviceAllocator {
    fn new(device_id: usize, capacity: usize) -> Self {
        Self {
            device_id,
            capacity,
            used: 0,
            next_addr: (device_id as u64 + 1) * DEVICE_ADDRESS_SPAN,
            live: HashMap::new(),
        }
    }

    fn allocate(&mut self, size: usize) -> Result<DevicePtr, DeviceError> {
        if self.capacity - self.used < size {
            return Err(DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested: size,
            });
        }
        let ptr = self.next_addr;
        let span = (size.max(1) as u64).div_ceil(DEVICE_ALIGN) * DEVICE_ALIGN;
        self.next_addr += span;
        self.used += size;
        self.live.insert(ptr, size);
        Ok(ptr)
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<usize, DeviceError> {
        let size = self.live.remove(&ptr).ok_or(DeviceError::InvalidPointer {
            device_id: self.device_id,
            ptr,
        })?;
        self.used -= size;
        Ok(size)
    }

    fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// Multi-device memory accounting.
#[derive(Debug)]
pub struct VramAllocator {
    /// Per-device allocators.
    devices: Vec<DeviceAllocator>,
}

impl VramAllocator {
    /// Create a new allocator for the given devices.
    ///
    /// `device_vram`: list of (device_id, vram_budget_bytes) pairs.
    pub fn new(device_vram: &[(usize, usize)]) -> Self {
        let devices = device_vram
            .iter()
            .map(|&(id, vram)| DeviceAllocator::new(id, vram))
            .collect();

        Self { devices }
    }

    fn device_mut(&mut self, device_id: usize) -> Result<&mut DeviceAllocator, DeviceError> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or(DeviceError::DeviceNotInitialized(device_id))
    }

    /// Allocate `size` bytes on the specified device.
    pub fn allocate(&mut self, device_id: usize, size: usize) -> Result<DevicePtr, DeviceError> {
        let ptr = self.device_mut(device_id)?.allocate(size)?;
        debug!(device = device_id, ptr, size, "Allocated device memory");
        Ok(ptr)
    }

    /// Free an allocation, returning its size.
    pub fn free(&mut self, device_id: usize, ptr: DevicePtr) -> Result<usize, DeviceError> {
        let size = self.device_mut(device_id)?.free(ptr)?;
        debug!(device = device_id, ptr, size, "Freed device memory");
        Ok(size)
    }

    /// Size of a live allocation.
    pub fn size_of(&self, device_id: usize, ptr: DevicePtr) -> Option<usize> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .and_then(|d| d.live.get(&ptr).copied())
    }

    /// Get utilization for each device as (device_id, fraction).
    pub fn utilization(&self) -> Vec<(usize, f64)> {
        self.devices
            .iter()
            .map(|d| (d.device_id, d.utilization()))
            .collect()
    }

    /// Bytes charged on one device.
    pub fn used(&self, device_id: usize) -> usize {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .map_or(0, |d| d.used)
    }

    /// Live allocations across all devices.
    pub fn total_allocations(&self) -> usize {
        self.devices.iter().map(|d| d.live.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut alloc = VramAllocator::new(&[(0, 4096), (1, 4096)]);

        let ptrs: Vec<_> = (0..4).map(|_| alloc.allocate(0, 1024).unwrap()).collect();
        assert_eq!(alloc.total_allocations(), 4);

        // Device 0 is full.
        assert!(matches!(
            alloc.allocate(0, 1),
            Err(DeviceError::OutOfMemory { device_id: 0, .. })
        ));

        assert_eq!(alloc.free(0, ptrs[0]).unwrap(), 1024);
        assert_eq!(alloc.total_allocations(), 3);
        alloc.allocate(0, 1024).unwrap();
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut alloc = VramAllocator::new(&[(0, 4096)]);
        let ptr = alloc.allocate(0, 100).unwrap();
        alloc.free(0, ptr).unwrap();
        assert!(matches!(
            alloc.free(0, ptr),
            Err(DeviceError::InvalidPointer { .. })
        ));
    }

    #[test]
    fn test_addresses_are_disjoint_per_device() {
        let mut alloc = VramAllocator::new(&[(0, 4096), (1, 4096)]);
        let a = alloc.allocate(0, 16).unwrap();
        let b = alloc.allocate(1, 16).unwrap();
        assert_ne!(a, b);
        assert!(alloc.free(1, a).is_err());
    }

    #[test]
    fn test_utilization() {
        let mut alloc = VramAllocator::new(&[(0, 4096)]);
        assert_eq!(alloc.utilization()[0].1, 0.0);

        alloc.allocate(0, 1024).unwrap();
        alloc.allocate(0, 1024).unwrap();

        let util = alloc.utilization();
        assert!((util[0].1 - 0.5).abs() < 1e-10);
        assert_eq!(alloc.used(0), 2048);
    }
}
