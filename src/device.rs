//! Compute-device identity as supplied by the compute backend.
//!
//! The compute backend owns device enumeration and index assignment; this
//! module only models the read-only facts the monitoring layer needs to
//! correlate a compute device with vendor adapter handles.

use serde::{Deserialize, Serialize};

/// PCI vendor id for AMD GPUs.
pub const VENDOR_ID_AMD: u32 = 0x1002;

/// PCI vendor id for NVIDIA GPUs.
pub const VENDOR_ID_NV: u32 = 0x10de;

/// Portable-API device-type bit marking a GPU device.
pub const DEVICE_TYPE_GPU: u32 = 1 << 2;

/// Which GPU API a compute device was opened through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    /// Native NVIDIA compute API.
    Cuda,
    /// Portable compute API (any vendor).
    OpenCl,
}

/// Physical PCI Express address of a device.
///
/// The (bus, device, function) triple uniquely identifies a device on the
/// bus and is the only key used to correlate compute devices with vendor
/// adapter handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcieAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PcieAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Decode a combined PCI slot id as exposed by some vendor APIs.
    ///
    /// Standard PCI slot encoding packs 5 bits of device number above
    /// 3 bits of function number: `device = slot >> 3`, `function = slot & 7`.
    pub fn from_packed_slot(bus: u8, slot: u32) -> Self {
        Self {
            bus,
            device: ((slot >> 3) & 0x1f) as u8,
            function: (slot & 7) as u8,
        }
    }
}

impl std::fmt::Display for PcieAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// One compute device known to the workload scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeDevice {
    /// Index assigned by the compute backend; capability records are keyed
    /// by this index.
    pub index: usize,
    pub runtime: RuntimeKind,
    pub vendor_id: u32,
    pub pcie: PcieAddress,
    /// Portable-API device-type bitmask; only the GPU bit matters here.
    pub device_type: u32,
    /// Skipped devices never receive a capability record.
    pub skipped: bool,
}

impl ComputeDevice {
    pub fn new(index: usize, runtime: RuntimeKind, vendor_id: u32, pcie: PcieAddress) -> Self {
        Self {
            index,
            runtime,
            vendor_id,
            pcie,
            device_type: DEVICE_TYPE_GPU,
            skipped: false,
        }
    }

    pub fn with_device_type(mut self, device_type: u32) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_skipped(mut self, skipped: bool) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn is_gpu(&self) -> bool {
        self.device_type & DEVICE_TYPE_GPU != 0
    }

    pub fn is_amd(&self) -> bool {
        self.vendor_id == VENDOR_ID_AMD
    }

    pub fn is_nvidia(&self) -> bool {
        self.vendor_id == VENDOR_ID_NV
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_slot_decomposition() {
        // device 3, function 5 => slot 0b11101
        let addr = PcieAddress::from_packed_slot(0x42, (3 << 3) | 5);
        assert_eq!(addr.bus, 0x42);
        assert_eq!(addr.device, 3);
        assert_eq!(addr.function, 5);

        let addr = PcieAddress::from_packed_slot(1, 0);
        assert_eq!((addr.device, addr.function), (0, 0));

        // 5-bit device field saturates at 31
        let addr = PcieAddress::from_packed_slot(0, (31 << 3) | 7);
        assert_eq!((addr.device, addr.function), (31, 7));
    }

    #[test]
    fn test_pcie_address_equality_is_exact() {
        let a = PcieAddress::new(1, 0, 0);
        assert_eq!(a, PcieAddress::new(1, 0, 0));
        assert_ne!(a, PcieAddress::new(1, 0, 1));
        assert_ne!(a, PcieAddress::new(1, 1, 0));
        assert_ne!(a, PcieAddress::new(2, 0, 0));
    }

    #[test]
    fn test_pcie_address_display() {
        let addr = PcieAddress::new(0x0a, 0x00, 3);
        assert_eq!(addr.to_string(), "0a:00.3");
    }

    #[test]
    fn test_compute_device_vendor_helpers() {
        let dev = ComputeDevice::new(0, RuntimeKind::OpenCl, VENDOR_ID_AMD, PcieAddress::new(3, 0, 0));
        assert!(dev.is_amd());
        assert!(!dev.is_nvidia());
        assert!(dev.is_gpu());

        let cpu = dev.clone().with_device_type(1 << 1);
        assert!(!cpu.is_gpu());
    }
}
