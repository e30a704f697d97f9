//! Programmable fake vendor backends.
//!
//! Each mock serves fixed readings keyed by handle and counts every call,
//! so tests can assert both values and probe behavior (probe-once,
//! fail-closed, precedence). A reading set to `None` makes that probe fail.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::backend::{
    AdlActivity, AdlAdapterInfo, AdlBackend, AdlFanSpeed, AdlHandle, AdlTargetTemperature,
    ClockKind, NvapiBackend, NvapiHandle, NvmlBackend, NvmlHandle, OverdriveCaps, SysfsBackend,
    ThresholdKind,
};
use crate::capability::Capability;
use crate::device::{ComputeDevice, PcieAddress};
use crate::{HwmonError, Result};

/// Per-operation call counts, shared between a test and the mock it handed
/// to the context.
#[derive(Debug, Default)]
pub struct CallCounters {
    counts: RefCell<HashMap<&'static str, usize>>,
}

impl CallCounters {
    fn bump(&self, op: &'static str) {
        *self.counts.borrow_mut().entry(op).or_insert(0) += 1;
    }

    pub fn count(&self, op: &str) -> usize {
        self.counts.borrow().get(op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.borrow().values().sum()
    }
}

fn injected(op: &str) -> HwmonError {
    HwmonError::Probe(format!("injected failure in {op}"))
}

/// One fake NVIDIA-management device.
#[derive(Debug, Clone)]
pub struct MockNvmlDevice {
    pcie: PcieAddress,
    temperature: Option<i64>,
    fan_speed: Option<i64>,
    core_clock: Option<i64>,
    memory_clock: Option<i64>,
    bus_lanes: Option<i64>,
    utilization: Option<i64>,
    threshold_slowdown: Option<i64>,
    threshold_shutdown: Option<i64>,
}

impl MockNvmlDevice {
    pub fn healthy(pcie: PcieAddress) -> Self {
        Self {
            pcie,
            temperature: Some(72),
            fan_speed: Some(55),
            core_clock: Some(1800),
            memory_clock: Some(9500),
            bus_lanes: Some(16),
            utilization: Some(88),
            threshold_slowdown: Some(93),
            threshold_shutdown: Some(101),
        }
    }

    /// Make every read of one capability fail.
    pub fn without(mut self, cap: Capability) -> Self {
        match cap {
            Capability::Temperature => self.temperature = None,
            Capability::FanSpeed => self.fan_speed = None,
            Capability::CoreClock => self.core_clock = None,
            Capability::MemoryClock => self.memory_clock = None,
            Capability::BusLanes => self.bus_lanes = None,
            Capability::Utilization => self.utilization = None,
            Capability::ThresholdSlowdown => self.threshold_slowdown = None,
            Capability::ThresholdShutdown => self.threshold_shutdown = None,
            // not served by this family
            Capability::FanPolicy | Capability::Throttle => {}
        }
        self
    }
}

#[derive(Debug, Default)]
pub struct MockNvml {
    devices: Vec<MockNvmlDevice>,
    counters: Rc<CallCounters>,
    fail_enumeration: bool,
}

impl MockNvml {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: MockNvmlDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    pub fn counters(&self) -> Rc<CallCounters> {
        Rc::clone(&self.counters)
    }

    fn value(
        &self,
        op: &'static str,
        handle: NvmlHandle,
        field: impl Fn(&MockNvmlDevice) -> Option<i64>,
    ) -> Result<i64> {
        self.counters.bump(op);
        self.devices
            .get(handle.0 as usize)
            .and_then(field)
            .ok_or_else(|| injected(op))
    }
}

impl NvmlBackend for MockNvml {
    fn device_handles(&self) -> Result<Vec<NvmlHandle>> {
        self.counters.bump("device_handles");
        if self.fail_enumeration {
            return Err(injected("device_handles"));
        }
        Ok((0..self.devices.len() as u32).map(NvmlHandle).collect())
    }

    fn pcie_address(&self, handle: NvmlHandle) -> Result<PcieAddress> {
        self.devices
            .get(handle.0 as usize)
            .map(|d| d.pcie)
            .ok_or_else(|| injected("pcie_address"))
    }

    fn temperature(&self, handle: NvmlHandle) -> Result<i64> {
        self.value("temperature", handle, |d| d.temperature)
    }

    fn fan_speed(&self, handle: NvmlHandle) -> Result<i64> {
        self.value("fan_speed", handle, |d| d.fan_speed)
    }

    fn clock(&self, handle: NvmlHandle, kind: ClockKind) -> Result<i64> {
        match kind {
            ClockKind::Core => self.value("core_clock", handle, |d| d.core_clock),
            ClockKind::Memory => self.value("memory_clock", handle, |d| d.memory_clock),
        }
    }

    fn pcie_link_width(&self, handle: NvmlHandle) -> Result<i64> {
        self.value("bus_lanes", handle, |d| d.bus_lanes)
    }

    fn utilization(&self, handle: NvmlHandle) -> Result<i64> {
        self.value("utilization", handle, |d| d.utilization)
    }

    fn temperature_threshold(&self, handle: NvmlHandle, kind: ThresholdKind) -> Result<i64> {
        match kind {
            ThresholdKind::Slowdown => {
                self.value("threshold_slowdown", handle, |d| d.threshold_slowdown)
            }
            ThresholdKind::Shutdown => {
                self.value("threshold_shutdown", handle, |d| d.threshold_shutdown)
            }
        }
    }

    fn close(&mut self) {
        self.counters.bump("close");
    }
}

/// One fake AMD adapter.
#[derive(Debug, Clone)]
pub struct MockAdlAdapter {
    pcie: PcieAddress,
    od_version: i32,
    /// Milli-degrees, as the native library reports them.
    temperature: Option<i64>,
    fan: Option<AdlFanSpeed>,
    /// Clocks in hundredths of MHz.
    activity: Option<AdlActivity>,
    target_temperature: Option<AdlTargetTemperature>,
}

impl MockAdlAdapter {
    pub fn healthy_od5(pcie: PcieAddress) -> Self {
        Self {
            pcie,
            od_version: 5,
            temperature: Some(45_000),
            fan: Some(AdlFanSpeed {
                percent: 40,
                user_defined: false,
            }),
            activity: Some(AdlActivity {
                engine_clock: 90_000,
                memory_clock: 50_000,
                bus_lanes: 8,
                activity_percent: 64,
            }),
            target_temperature: None,
        }
    }

    pub fn healthy_od6(pcie: PcieAddress) -> Self {
        Self {
            od_version: 6,
            target_temperature: Some(AdlTargetTemperature {
                current: 88,
                default_value: 95,
            }),
            ..Self::healthy_od5(pcie)
        }
    }

    pub fn with_od_version(mut self, version: i32) -> Self {
        self.od_version = version;
        self
    }

    pub fn with_user_defined_fan(mut self) -> Self {
        if let Some(fan) = &mut self.fan {
            fan.user_defined = true;
        }
        self
    }

    pub fn without_fan(mut self) -> Self {
        self.fan = None;
        self
    }

    pub fn without_temperature(mut self) -> Self {
        self.temperature = None;
        self
    }

    pub fn without_activity(mut self) -> Self {
        self.activity = None;
        self
    }
}

#[derive(Debug, Default)]
pub struct MockAdl {
    adapters: Vec<MockAdlAdapter>,
    counters: Rc<CallCounters>,
    fail_adapter_info: bool,
}

impl MockAdl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: MockAdlAdapter) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_failing_adapter_info(mut self) -> Self {
        self.fail_adapter_info = true;
        self
    }

    pub fn counters(&self) -> Rc<CallCounters> {
        Rc::clone(&self.counters)
    }

    fn adapter(&self, handle: AdlHandle) -> Result<&MockAdlAdapter> {
        self.adapters
            .get(handle.0 as usize)
            .ok_or_else(|| injected("adapter lookup"))
    }
}

impl AdlBackend for MockAdl {
    fn adapter_info(&self) -> Result<Vec<AdlAdapterInfo>> {
        self.counters.bump("adapter_info");
        if self.fail_adapter_info {
            return Err(injected("adapter_info"));
        }
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(i, a)| AdlAdapterInfo {
                handle: AdlHandle(i as i32),
                pcie: a.pcie,
            })
            .collect())
    }

    fn overdrive_caps(&self, handle: AdlHandle) -> Result<OverdriveCaps> {
        self.counters.bump("overdrive_caps");
        let adapter = self.adapter(handle)?;
        Ok(OverdriveCaps {
            supported: true,
            enabled: true,
            version: adapter.od_version,
        })
    }

    fn od5_temperature(&self, handle: AdlHandle) -> Result<i64> {
        self.counters.bump("temperature");
        self.adapter(handle)?
            .temperature
            .ok_or_else(|| injected("temperature"))
    }

    fn od6_temperature(&self, handle: AdlHandle) -> Result<i64> {
        self.counters.bump("temperature");
        self.adapter(handle)?
            .temperature
            .ok_or_else(|| injected("temperature"))
    }

    fn od5_fan_speed(&self, handle: AdlHandle) -> Result<AdlFanSpeed> {
        self.counters.bump("fan_speed");
        self.adapter(handle)?.fan.ok_or_else(|| injected("fan_speed"))
    }

    fn od6_fan_speed(&self, handle: AdlHandle) -> Result<i64> {
        self.counters.bump("fan_speed");
        self.adapter(handle)?
            .fan
            .map(|f| f.percent)
            .ok_or_else(|| injected("fan_speed"))
    }

    fn current_activity(&self, handle: AdlHandle) -> Result<AdlActivity> {
        self.counters.bump("activity");
        self.adapter(handle)?
            .activity
            .ok_or_else(|| injected("activity"))
    }

    fn od6_target_temperature(&self, handle: AdlHandle) -> Result<AdlTargetTemperature> {
        self.counters.bump("target_temperature");
        self.adapter(handle)?
            .target_temperature
            .ok_or_else(|| injected("target_temperature"))
    }

    fn close(&mut self) {
        self.counters.bump("close");
    }
}

#[derive(Debug, Default)]
pub struct MockNvapi {
    gpus: Vec<(PcieAddress, Option<u32>)>,
    counters: Rc<CallCounters>,
}

impl MockNvapi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self, pcie: PcieAddress, perf_status: u32) -> Self {
        self.gpus.push((pcie, Some(perf_status)));
        self
    }

    pub fn with_failing_gpu(mut self, pcie: PcieAddress) -> Self {
        self.gpus.push((pcie, None));
        self
    }

    pub fn counters(&self) -> Rc<CallCounters> {
        Rc::clone(&self.counters)
    }
}

impl NvapiBackend for MockNvapi {
    fn gpu_handles(&self) -> Result<Vec<NvapiHandle>> {
        self.counters.bump("gpu_handles");
        Ok((0..self.gpus.len() as u32).map(NvapiHandle).collect())
    }

    fn pcie_address(&self, handle: NvapiHandle) -> Result<PcieAddress> {
        self.gpus
            .get(handle.0 as usize)
            .map(|(pcie, _)| *pcie)
            .ok_or_else(|| injected("pcie_address"))
    }

    fn perf_policies_status(&self, handle: NvapiHandle) -> Result<u32> {
        self.counters.bump("throttle");
        self.gpus
            .get(handle.0 as usize)
            .and_then(|(_, status)| *status)
            .ok_or_else(|| injected("throttle"))
    }

    fn close(&mut self) {
        self.counters.bump("close");
    }
}

/// Fake OS-file-based backend serving one set of readings to every
/// attached device.
#[derive(Debug)]
pub struct MockSysfs {
    attached: HashSet<usize>,
    temperature: Option<i64>,
    fan_speed: Option<i64>,
    core_clock: Option<i64>,
    memory_clock: Option<i64>,
    bus_lanes: Option<i64>,
    utilization: Option<i64>,
    counters: Rc<CallCounters>,
    fail_attach: bool,
}

impl MockSysfs {
    pub fn healthy() -> Self {
        Self {
            attached: HashSet::new(),
            temperature: Some(61),
            fan_speed: Some(35),
            core_clock: Some(1450),
            memory_clock: Some(1750),
            bus_lanes: Some(16),
            utilization: Some(73),
            counters: Rc::default(),
            fail_attach: false,
        }
    }

    pub fn with_failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn without(mut self, cap: Capability) -> Self {
        match cap {
            Capability::Temperature => self.temperature = None,
            Capability::FanSpeed => self.fan_speed = None,
            Capability::CoreClock => self.core_clock = None,
            Capability::MemoryClock => self.memory_clock = None,
            Capability::BusLanes => self.bus_lanes = None,
            Capability::Utilization => self.utilization = None,
            _ => {}
        }
        self
    }

    pub fn counters(&self) -> Rc<CallCounters> {
        Rc::clone(&self.counters)
    }

    fn value(&self, op: &'static str, device_index: usize, field: Option<i64>) -> Result<i64> {
        self.counters.bump(op);
        if !self.attached.contains(&device_index) {
            return Err(injected(op));
        }
        field.ok_or_else(|| injected(op))
    }
}

impl SysfsBackend for MockSysfs {
    fn attach(&mut self, device: &ComputeDevice) -> Result<()> {
        self.counters.bump("attach");
        if self.fail_attach {
            return Err(injected("attach"));
        }
        self.attached.insert(device.index);
        Ok(())
    }

    fn temperature(&self, device_index: usize) -> Result<i64> {
        self.value("temperature", device_index, self.temperature)
    }

    fn fan_speed(&self, device_index: usize) -> Result<i64> {
        self.value("fan_speed", device_index, self.fan_speed)
    }

    fn core_clock(&self, device_index: usize) -> Result<i64> {
        self.value("core_clock", device_index, self.core_clock)
    }

    fn memory_clock(&self, device_index: usize) -> Result<i64> {
        self.value("memory_clock", device_index, self.memory_clock)
    }

    fn bus_lanes(&self, device_index: usize) -> Result<i64> {
        self.value("bus_lanes", device_index, self.bus_lanes)
    }

    fn utilization(&self, device_index: usize) -> Result<i64> {
        self.value("utilization", device_index, self.utilization)
    }

    fn close(&mut self) {
        self.counters.bump("close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RuntimeKind, VENDOR_ID_AMD};

    #[test]
    fn test_counters_track_per_operation() {
        let nvml = MockNvml::new().with_device(MockNvmlDevice::healthy(PcieAddress::new(1, 0, 0)));
        let counters = nvml.counters();

        nvml.temperature(NvmlHandle(0)).unwrap();
        nvml.temperature(NvmlHandle(0)).unwrap();
        nvml.fan_speed(NvmlHandle(0)).unwrap();

        assert_eq!(counters.count("temperature"), 2);
        assert_eq!(counters.count("fan_speed"), 1);
        assert_eq!(counters.count("utilization"), 0);
        assert_eq!(counters.total(), 3);
    }

    #[test]
    fn test_failure_injection() {
        let nvml = MockNvml::new().with_device(
            MockNvmlDevice::healthy(PcieAddress::new(1, 0, 0)).without(Capability::Temperature),
        );
        assert!(nvml.temperature(NvmlHandle(0)).is_err());
        assert_eq!(nvml.fan_speed(NvmlHandle(0)).unwrap(), 55);
    }

    #[test]
    fn test_adapter_info_failure() {
        let adl = MockAdl::new().with_failing_adapter_info();
        assert!(adl.adapter_info().is_err());
    }

    #[test]
    fn test_unknown_handle_fails() {
        let nvml = MockNvml::new();
        assert!(nvml.temperature(NvmlHandle(3)).is_err());
    }

    #[test]
    fn test_sysfs_requires_attach() {
        let mut sysfs = MockSysfs::healthy();
        assert!(sysfs.temperature(0).is_err());

        let device = ComputeDevice::new(
            0,
            RuntimeKind::OpenCl,
            VENDOR_ID_AMD,
            PcieAddress::new(3, 0, 0),
        );
        sysfs.attach(&device).unwrap();
        assert_eq!(sysfs.temperature(0).unwrap(), 61);
    }
}
