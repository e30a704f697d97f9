//! Vendor family interfaces.
//!
//! One synchronous trait per vendor family, expressed in the logical
//! operations the monitoring core needs. Loading the vendor shared library
//! and binding its symbols is the embedder's responsibility: the context
//! receives a [`VendorBackends`] container in which `None` means the
//! library failed to load. All handles are non-owning references, valid
//! for the process lifetime of the loaded library.

use crate::device::{ComputeDevice, PcieAddress};
use crate::Result;

/// AMD native-library adapter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdlHandle(pub i32);

/// NVIDIA management-library device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvmlHandle(pub u32);

/// NVIDIA low-level-API physical GPU handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvapiHandle(pub u32);

/// One enumerated AMD adapter with its bus location.
#[derive(Debug, Clone, Copy)]
pub struct AdlAdapterInfo {
    pub handle: AdlHandle,
    pub pcie: PcieAddress,
}

/// AMD overdrive capability report.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverdriveCaps {
    pub supported: bool,
    pub enabled: bool,
    /// Overdrive generation: 5 (legacy) or 6 (newer); anything else is
    /// treated as unusable.
    pub version: i32,
}

/// AMD Overdrive 5 fan speed reading.
#[derive(Debug, Clone, Copy)]
pub struct AdlFanSpeed {
    pub percent: i64,
    /// Set when the user pinned a manual fan speed.
    pub user_defined: bool,
}

/// AMD performance-activity block.
///
/// Clock values are in hundredths of MHz as reported by the library.
#[derive(Debug, Clone, Copy)]
pub struct AdlActivity {
    pub engine_clock: i64,
    pub memory_clock: i64,
    pub bus_lanes: i64,
    pub activity_percent: i64,
}

/// AMD Overdrive 6 target-temperature report.
#[derive(Debug, Clone, Copy)]
pub struct AdlTargetTemperature {
    pub current: i64,
    pub default_value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Core,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Slowdown,
    Shutdown,
}

/// AMD native family ("ADL").
pub trait AdlBackend {
    /// Enumerate adapters with their bus locations.
    ///
    /// An error here means device identity cannot be established at all and
    /// aborts monitoring initialization; an empty table is merely an
    /// unavailable family.
    fn adapter_info(&self) -> Result<Vec<AdlAdapterInfo>>;

    fn overdrive_caps(&self, adapter: AdlHandle) -> Result<OverdriveCaps>;

    /// Overdrive 5 temperature in milli-degrees Celsius.
    fn od5_temperature(&self, adapter: AdlHandle) -> Result<i64>;

    /// Overdrive 6 temperature in milli-degrees Celsius.
    fn od6_temperature(&self, adapter: AdlHandle) -> Result<i64>;

    fn od5_fan_speed(&self, adapter: AdlHandle) -> Result<AdlFanSpeed>;

    /// Overdrive 6 fan speed in percent.
    fn od6_fan_speed(&self, adapter: AdlHandle) -> Result<i64>;

    fn current_activity(&self, adapter: AdlHandle) -> Result<AdlActivity>;

    fn od6_target_temperature(&self, adapter: AdlHandle) -> Result<AdlTargetTemperature>;

    /// Tear down the vendor control block.
    fn close(&mut self) {}
}

/// NVIDIA management family ("NVML").
pub trait NvmlBackend {
    /// Enumerate device handles. An empty list is a soft condition.
    fn device_handles(&self) -> Result<Vec<NvmlHandle>>;

    fn pcie_address(&self, handle: NvmlHandle) -> Result<PcieAddress>;

    /// GPU temperature in degrees Celsius.
    fn temperature(&self, handle: NvmlHandle) -> Result<i64>;

    /// Fan speed in percent.
    fn fan_speed(&self, handle: NvmlHandle) -> Result<i64>;

    /// Current clock in MHz.
    fn clock(&self, handle: NvmlHandle, kind: ClockKind) -> Result<i64>;

    /// Current PCIe link width in lanes.
    fn pcie_link_width(&self, handle: NvmlHandle) -> Result<i64>;

    /// GPU utilization in percent.
    fn utilization(&self, handle: NvmlHandle) -> Result<i64>;

    /// Thermal threshold in degrees Celsius.
    fn temperature_threshold(&self, handle: NvmlHandle, kind: ThresholdKind) -> Result<i64>;

    /// Shut down the library session.
    fn close(&mut self) {}
}

/// NVIDIA low-level family ("NVAPI").
pub trait NvapiBackend {
    /// Enumerate physical GPU handles. An empty list is a soft condition.
    fn gpu_handles(&self) -> Result<Vec<NvapiHandle>>;

    fn pcie_address(&self, handle: NvapiHandle) -> Result<PcieAddress>;

    /// Performance-policy status word; bit value 2 means hardware slowdown
    /// is active.
    fn perf_policies_status(&self, handle: NvapiHandle) -> Result<u32>;

    /// Unload the library.
    fn close(&mut self) {}
}

/// OS-file-based family, the AMD fallback when the native library is
/// unavailable. Keyed by compute-device index; values are already in
/// display units.
pub trait SysfsBackend {
    /// Register a compute device with the backend so later reads can find
    /// its telemetry files.
    fn attach(&mut self, device: &ComputeDevice) -> Result<()>;

    fn temperature(&self, device_index: usize) -> Result<i64>;

    fn fan_speed(&self, device_index: usize) -> Result<i64>;

    fn core_clock(&self, device_index: usize) -> Result<i64>;

    fn memory_clock(&self, device_index: usize) -> Result<i64>;

    fn bus_lanes(&self, device_index: usize) -> Result<i64>;

    fn utilization(&self, device_index: usize) -> Result<i64>;

    /// Close any open file references.
    fn close(&mut self) {}
}

/// The vendor libraries the embedder managed to load.
///
/// Each field is `None` when that family's library failed to load or was
/// not requested. Ownership of every backend transfers to the monitoring
/// context at initialization.
#[derive(Default)]
pub struct VendorBackends {
    pub adl: Option<Box<dyn AdlBackend>>,
    pub nvml: Option<Box<dyn NvmlBackend>>,
    pub nvapi: Option<Box<dyn NvapiBackend>>,
    pub sysfs: Option<Box<dyn SysfsBackend>>,
}

impl VendorBackends {
    pub fn with_adl(mut self, backend: Box<dyn AdlBackend>) -> Self {
        self.adl = Some(backend);
        self
    }

    pub fn with_nvml(mut self, backend: Box<dyn NvmlBackend>) -> Self {
        self.nvml = Some(backend);
        self
    }

    pub fn with_nvapi(mut self, backend: Box<dyn NvapiBackend>) -> Self {
        self.nvapi = Some(backend);
        self
    }

    pub fn with_sysfs(mut self, backend: Box<dyn SysfsBackend>) -> Self {
        self.sysfs = Some(backend);
        self
    }
}

impl std::fmt::Debug for VendorBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorBackends")
            .field("adl", &self.adl.is_some())
            .field("nvml", &self.nvml.is_some())
            .field("nvapi", &self.nvapi.is_some())
            .field("sysfs", &self.sysfs.is_some())
            .finish()
    }
}
