//! Monitoring context: owns the loaded vendor backends, the per-device
//! capability records, and the ten unified telemetry accessors.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ClockKind, ThresholdKind, VendorBackends};
use crate::capability::{Capability, DeviceRecord, DispatchInfo, Route};
use crate::config::HwmonConfig;
use crate::device::ComputeDevice;
use crate::resolve;
use crate::{HwmonError, Result};

/// Fan policy value meaning the driver controls the fan.
pub const FAN_POLICY_AUTOMATIC: i64 = 1;

/// Fan policy value meaning a user pinned a manual fan speed.
pub const FAN_POLICY_MANUAL: i64 = 0;

/// Clock levels captured before an overdrive adjustment, consumed by the
/// clock-restore path at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMemClockState {
    pub engine_clock: i64,
    pub memory_clock: i64,
}

/// Hardware-monitoring state for one run.
///
/// Explicitly owned; every accessor takes the context by reference. An
/// uninitialized or destroyed context answers every query with `None`.
pub struct HwmonContext {
    enabled: bool,
    records: Vec<Option<DeviceRecord>>,
    backends: VendorBackends,
    saved_clock_state: Vec<SavedMemClockState>,
}

impl HwmonContext {
    fn inert() -> Self {
        Self {
            enabled: false,
            records: Vec::new(),
            backends: VendorBackends::default(),
            saved_clock_state: Vec::new(),
        }
    }

    /// Bring up hardware monitoring for the given devices.
    ///
    /// Non-monitoring run modes and runs where no vendor family produces a
    /// usable device mapping both yield a clean disabled context; only a
    /// failed AMD adapter enumeration is an error, because without the
    /// adapter table device identity cannot be established.
    pub fn init(
        config: &HwmonConfig,
        devices: &[ComputeDevice],
        mut backends: VendorBackends,
    ) -> Result<Self> {
        config.validate()?;

        if !config.monitoring_active() {
            debug!(run_mode = %config.run_mode, "hardware monitoring not requested");
            return Ok(Self::inert());
        }

        for (family, present) in [
            ("ADL", backends.adl.is_some()),
            ("NVML", backends.nvml.is_some()),
            ("NvAPI", backends.nvapi.is_some()),
            ("sysfs", backends.sysfs.is_some()),
        ] {
            if !present {
                warn!("{family} support not loaded");
            }
        }

        // NvAPI only supplements NVML; on its own it cannot carry a device.
        if backends.nvapi.is_some() && backends.nvml.is_none() {
            warn!("NvAPI loaded without NVML, ignoring NvAPI");
            if let Some(mut nvapi) = backends.nvapi.take() {
                nvapi.close();
            }
        }

        // The native AMD library supersedes the sysfs fallback.
        if backends.adl.is_some() && backends.sysfs.is_some() {
            debug!("native AMD library loaded, sysfs fallback not needed");
            if let Some(mut sysfs) = backends.sysfs.take() {
                sysfs.close();
            }
        }

        let resolution = match resolve::resolve(devices, &mut backends) {
            Ok(resolution) => resolution,
            Err(err) => {
                close_all(&mut backends);
                return Err(err);
            }
        };

        if !resolution.hardware_backed {
            info!("no usable hardware-monitoring mapping, monitoring disabled");
            close_all(&mut backends);
            return Ok(Self::inert());
        }

        let mut ctx = Self {
            enabled: true,
            records: resolution.records,
            backends,
            saved_clock_state: vec![SavedMemClockState::default(); devices.len()],
        };
        ctx.warm_up();

        let monitored = ctx.records.iter().filter(|r| r.is_some()).count();
        info!(devices = monitored, "hardware monitoring enabled");
        Ok(ctx)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn device_record(&self, device_index: usize) -> Option<&DeviceRecord> {
        self.records.get(device_index)?.as_ref()
    }

    pub fn saved_clock_state(&self) -> &[SavedMemClockState] {
        &self.saved_clock_state
    }

    pub fn saved_clock_state_mut(&mut self) -> &mut [SavedMemClockState] {
        &mut self.saved_clock_state
    }

    /// GPU temperature in degrees Celsius.
    pub fn get_temperature(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::Temperature)
    }

    /// Fan speed in percent.
    pub fn get_fan_speed(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::FanSpeed)
    }

    /// [`FAN_POLICY_AUTOMATIC`] or [`FAN_POLICY_MANUAL`].
    pub fn get_fan_policy(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::FanPolicy)
    }

    /// GPU utilization in percent.
    pub fn get_utilization(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::Utilization)
    }

    /// Current core clock in MHz.
    pub fn get_core_clock(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::CoreClock)
    }

    /// Current memory clock in MHz.
    pub fn get_memory_clock(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::MemoryClock)
    }

    /// Current PCIe link width in lanes.
    pub fn get_bus_lanes(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::BusLanes)
    }

    /// Slowdown-threshold temperature in degrees Celsius.
    pub fn get_threshold_slowdown(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::ThresholdSlowdown)
    }

    /// Shutdown-threshold temperature in degrees Celsius.
    pub fn get_threshold_shutdown(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::ThresholdShutdown)
    }

    /// 1 when a hardware slowdown is currently active, else 0.
    pub fn get_throttle(&mut self, device_index: usize) -> Option<i64> {
        self.read(device_index, Capability::Throttle)
    }

    fn read(&mut self, device_index: usize, cap: Capability) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let record = self.records.get_mut(device_index)?.as_mut()?;
        if record.caps.is_disabled(cap) {
            return None;
        }
        let dispatch = record.dispatch;
        match probe(&self.backends, &dispatch, cap) {
            Ok(value) => {
                record.caps.note_success(cap);
                Some(value)
            }
            Err(err) => {
                debug!(device = device_index, capability = %cap, "probe failed: {err}");
                record.caps.disable(cap);
                // The Overdrive 5 fan policy reads through the fan-speed
                // block, so a failure there takes out both fan capabilities.
                if cap == Capability::FanPolicy && dispatch.route(cap) == Route::AdlOd5 {
                    record.caps.disable(Capability::FanSpeed);
                }
                None
            }
        }
    }

    /// Probe every capability of every monitored device once, so vendor
    /// errors surface (and disable their capability) at startup instead of
    /// repeating in the steady-state poll loop.
    fn warm_up(&mut self) {
        for device_index in 0..self.records.len() {
            for cap in Capability::ALL {
                let _ = self.read(device_index, cap);
            }
        }
    }

    /// Shut down all vendor families and reset the context. Idempotent,
    /// also runs on drop.
    pub fn destroy(&mut self) {
        close_all(&mut self.backends);
        self.records.clear();
        self.saved_clock_state.clear();
        self.enabled = false;
    }
}

impl Drop for HwmonContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for HwmonContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwmonContext")
            .field("enabled", &self.enabled)
            .field("devices", &self.records.len())
            .field("backends", &self.backends)
            .finish()
    }
}

fn close_all(backends: &mut VendorBackends) {
    if let Some(mut nvml) = backends.nvml.take() {
        nvml.close();
    }
    if let Some(mut nvapi) = backends.nvapi.take() {
        nvapi.close();
    }
    if let Some(mut adl) = backends.adl.take() {
        adl.close();
    }
    if let Some(mut sysfs) = backends.sysfs.take() {
        sysfs.close();
    }
}

/// Execute one probe along the route fixed at resolution time.
///
/// Raw-unit normalization happens here: AMD native temperatures arrive in
/// milli-degrees (divide by 1000), overdrive clocks in hundredths of MHz
/// (divide by 100). Every other path already reports display units.
fn probe(backends: &VendorBackends, dispatch: &DispatchInfo, cap: Capability) -> Result<i64> {
    let missing = || HwmonError::Unavailable(format!("no backend routed for {cap}"));
    let route = dispatch.route(cap);
    match route {
        Route::None => Err(missing()),
        Route::FanAuto => Ok(FAN_POLICY_AUTOMATIC),
        Route::Nvml => {
            let backend = backends.nvml.as_deref().ok_or_else(missing)?;
            let handle = dispatch.nvml.ok_or_else(missing)?;
            match cap {
                Capability::Temperature => backend.temperature(handle),
                Capability::FanSpeed => backend.fan_speed(handle),
                Capability::Utilization => backend.utilization(handle),
                Capability::CoreClock => backend.clock(handle, ClockKind::Core),
                Capability::MemoryClock => backend.clock(handle, ClockKind::Memory),
                Capability::BusLanes => backend.pcie_link_width(handle),
                Capability::ThresholdSlowdown => {
                    backend.temperature_threshold(handle, ThresholdKind::Slowdown)
                }
                Capability::ThresholdShutdown => {
                    backend.temperature_threshold(handle, ThresholdKind::Shutdown)
                }
                _ => Err(missing()),
            }
        }
        Route::Nvapi => {
            let backend = backends.nvapi.as_deref().ok_or_else(missing)?;
            let handle = dispatch.nvapi.ok_or_else(missing)?;
            match cap {
                // Bit value 2 of the status word flags an active hardware
                // slowdown; everything else in the word is ignored.
                Capability::Throttle => {
                    let status = backend.perf_policies_status(handle)?;
                    Ok(i64::from(status & 2 != 0))
                }
                _ => Err(missing()),
            }
        }
        Route::AdlOd5 | Route::AdlOd6 | Route::Adl => {
            let backend = backends.adl.as_deref().ok_or_else(missing)?;
            let handle = dispatch.adl.ok_or_else(missing)?;
            match (cap, route) {
                (Capability::Temperature, Route::AdlOd5) => {
                    Ok(backend.od5_temperature(handle)? / 1000)
                }
                (Capability::Temperature, Route::AdlOd6) => {
                    Ok(backend.od6_temperature(handle)? / 1000)
                }
                (Capability::FanSpeed, Route::AdlOd5) => {
                    Ok(backend.od5_fan_speed(handle)?.percent)
                }
                (Capability::FanSpeed, Route::AdlOd6) => backend.od6_fan_speed(handle),
                (Capability::FanPolicy, Route::AdlOd5) => {
                    let fan = backend.od5_fan_speed(handle)?;
                    Ok(if fan.user_defined {
                        FAN_POLICY_MANUAL
                    } else {
                        FAN_POLICY_AUTOMATIC
                    })
                }
                (Capability::Utilization, _) => {
                    Ok(backend.current_activity(handle)?.activity_percent)
                }
                (Capability::CoreClock, _) => {
                    Ok(backend.current_activity(handle)?.engine_clock / 100)
                }
                (Capability::MemoryClock, _) => {
                    Ok(backend.current_activity(handle)?.memory_clock / 100)
                }
                (Capability::BusLanes, _) => Ok(backend.current_activity(handle)?.bus_lanes),
                (Capability::ThresholdSlowdown, Route::AdlOd6) => {
                    Ok(backend.od6_target_temperature(handle)?.default_value)
                }
                _ => Err(missing()),
            }
        }
        Route::Sysfs => {
            let backend = backends.sysfs.as_deref().ok_or_else(missing)?;
            let index = dispatch.device_index;
            match cap {
                Capability::Temperature => backend.temperature(index),
                Capability::FanSpeed => backend.fan_speed(index),
                Capability::Utilization => backend.utilization(index),
                Capability::CoreClock => backend.core_clock(index),
                Capability::MemoryClock => backend.memory_clock(index),
                Capability::BusLanes => backend.bus_lanes(index),
                _ => Err(missing()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapState;
    use crate::config::RunMode;
    use crate::device::{PcieAddress, RuntimeKind, VENDOR_ID_AMD, VENDOR_ID_NV};
    use crate::mock::{
        MockAdl, MockAdlAdapter, MockNvapi, MockNvml, MockNvmlDevice, MockSysfs,
    };

    fn nv_device(index: usize, bus: u8) -> ComputeDevice {
        ComputeDevice::new(
            index,
            RuntimeKind::Cuda,
            VENDOR_ID_NV,
            PcieAddress::new(bus, 0, 0),
        )
    }

    fn amd_device(index: usize, bus: u8) -> ComputeDevice {
        ComputeDevice::new(
            index,
            RuntimeKind::OpenCl,
            VENDOR_ID_AMD,
            PcieAddress::new(bus, 0, 0),
        )
    }

    #[test]
    fn test_disabled_monitoring_attempts_no_probes() {
        let nvml = MockNvml::new().with_device(MockNvmlDevice::healthy(PcieAddress::new(1, 0, 0)));
        let counters = nvml.counters();
        let config = HwmonConfig::default().with_monitoring_disabled(true);

        let mut ctx = HwmonContext::init(
            &config,
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvml(Box::new(nvml)),
        )
        .unwrap();

        assert!(!ctx.is_enabled());
        assert_eq!(ctx.get_temperature(0), None);
        assert_eq!(counters.count("temperature"), 0);
        assert_eq!(counters.count("device_handles"), 0);
    }

    #[test]
    fn test_informational_run_mode_short_circuits() {
        let config = HwmonConfig::new(RunMode::Version);
        let ctx =
            HwmonContext::init(&config, &[nv_device(0, 1)], VendorBackends::default()).unwrap();
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn test_no_adapters_is_clean_disabled_success() {
        let config = HwmonConfig::default();
        let mut ctx = HwmonContext::init(
            &config,
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvml(Box::new(MockNvml::new())),
        )
        .unwrap();

        assert!(!ctx.is_enabled());
        assert_eq!(ctx.get_temperature(0), None);
    }

    #[test]
    fn test_nvapi_without_nvml_is_dropped() {
        let nvapi = MockNvapi::new().with_gpu(PcieAddress::new(1, 0, 0), 0);
        let counters = nvapi.counters();

        let ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvapi(Box::new(nvapi)),
        )
        .unwrap();

        assert!(!ctx.is_enabled());
        assert_eq!(counters.count("gpu_handles"), 0);
        assert_eq!(counters.count("close"), 1);
    }

    #[test]
    fn test_adapter_enumeration_failure_aborts_init() {
        let adl = MockAdl::new().with_failing_adapter_info();
        let err = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap_err();
        assert!(matches!(err, HwmonError::AdapterInfo(_)));
    }

    #[test]
    fn test_nvidia_readings_end_to_end() {
        let pcie = PcieAddress::new(1, 0, 0);
        let backends = VendorBackends::default()
            .with_nvml(Box::new(
                MockNvml::new().with_device(MockNvmlDevice::healthy(pcie)),
            ))
            .with_nvapi(Box::new(MockNvapi::new().with_gpu(pcie, 0)));

        let mut ctx =
            HwmonContext::init(&HwmonConfig::default(), &[nv_device(0, 1)], backends).unwrap();

        assert!(ctx.is_enabled());
        assert_eq!(ctx.get_temperature(0), Some(72));
        assert_eq!(ctx.get_fan_speed(0), Some(55));
        assert_eq!(ctx.get_core_clock(0), Some(1800));
        assert_eq!(ctx.get_memory_clock(0), Some(9500));
        assert_eq!(ctx.get_bus_lanes(0), Some(16));
        assert_eq!(ctx.get_utilization(0), Some(88));
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));
        assert_eq!(ctx.get_threshold_slowdown(0), Some(93));
        assert_eq!(ctx.get_threshold_shutdown(0), Some(101));
        assert_eq!(ctx.get_throttle(0), Some(0));
    }

    #[test]
    fn test_throttle_reports_slowdown_bit_only() {
        let pcie = PcieAddress::new(1, 0, 0);
        let backends = VendorBackends::default()
            .with_nvml(Box::new(
                MockNvml::new().with_device(MockNvmlDevice::healthy(pcie)),
            ))
            // bits other than 2 must not register as throttling
            .with_nvapi(Box::new(MockNvapi::new().with_gpu(pcie, 0b101)));
        let mut ctx =
            HwmonContext::init(&HwmonConfig::default(), &[nv_device(0, 1)], backends).unwrap();
        assert_eq!(ctx.get_throttle(0), Some(0));

        let backends = VendorBackends::default()
            .with_nvml(Box::new(
                MockNvml::new().with_device(MockNvmlDevice::healthy(pcie)),
            ))
            .with_nvapi(Box::new(MockNvapi::new().with_gpu(pcie, 0b111)));
        let mut ctx =
            HwmonContext::init(&HwmonConfig::default(), &[nv_device(0, 1)], backends).unwrap();
        assert_eq!(ctx.get_throttle(0), Some(1));
    }

    #[test]
    fn test_failed_probe_disables_permanently_and_probes_once() {
        let pcie = PcieAddress::new(1, 0, 0);
        let nvml = MockNvml::new().with_device(
            MockNvmlDevice::healthy(pcie).without(Capability::Temperature),
        );
        let counters = nvml.counters();

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvml(Box::new(nvml)),
        )
        .unwrap();

        // warm-up already hit the broken read exactly once
        assert_eq!(counters.count("temperature"), 1);
        assert_eq!(ctx.get_temperature(0), None);
        assert_eq!(ctx.get_temperature(0), None);
        assert_eq!(counters.count("temperature"), 1);

        let record = ctx.device_record(0).unwrap();
        assert_eq!(record.caps.state(Capability::Temperature), CapState::Disabled);
        assert_eq!(record.caps.state(Capability::FanSpeed), CapState::Supported);
    }

    #[test]
    fn test_adl_temperature_and_clock_normalization() {
        // adapter reports 45000 milli-degrees and 90000 hundredth-MHz
        let adl = MockAdl::new()
            .with_adapter(MockAdlAdapter::healthy_od5(PcieAddress::new(3, 0, 0)));

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();

        assert_eq!(ctx.get_temperature(0), Some(45));
        assert_eq!(ctx.get_core_clock(0), Some(900));
        assert_eq!(ctx.get_memory_clock(0), Some(500));
        assert_eq!(ctx.get_bus_lanes(0), Some(8));
    }

    #[test]
    fn test_fan_policy_fixtures() {
        let pcie = PcieAddress::new(3, 0, 0);

        let adl = MockAdl::new().with_adapter(MockAdlAdapter::healthy_od5(pcie));
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));

        let adl = MockAdl::new()
            .with_adapter(MockAdlAdapter::healthy_od5(pcie).with_user_defined_fan());
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_MANUAL));

        // Overdrive 6 has no policy signal, reads as automatic
        let adl = MockAdl::new().with_adapter(MockAdlAdapter::healthy_od6(pcie));
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));
    }

    #[test]
    fn test_od5_fan_failure_disables_both_fan_capabilities() {
        let adl = MockAdl::new().with_adapter(
            MockAdlAdapter::healthy_od5(PcieAddress::new(3, 0, 0)).without_fan(),
        );

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();

        assert_eq!(ctx.get_fan_speed(0), None);
        assert_eq!(ctx.get_fan_policy(0), None);
        let record = ctx.device_record(0).unwrap();
        assert!(record.caps.is_disabled(Capability::FanSpeed));
        assert!(record.caps.is_disabled(Capability::FanPolicy));
        // the rest of the adapter keeps working
        assert_eq!(ctx.get_temperature(0), Some(45));
    }

    #[test]
    fn test_od6_thresholds() {
        let adl = MockAdl::new()
            .with_adapter(MockAdlAdapter::healthy_od6(PcieAddress::new(3, 0, 0)));

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_adl(Box::new(adl)),
        )
        .unwrap();

        assert_eq!(ctx.get_threshold_slowdown(0), Some(95));
        // no shutdown-threshold query exists on this family
        assert_eq!(ctx.get_threshold_shutdown(0), None);
        assert_eq!(ctx.get_throttle(0), None);
    }

    #[test]
    fn test_adl_takes_precedence_over_sysfs() {
        let adl = MockAdl::new()
            .with_adapter(MockAdlAdapter::healthy_od5(PcieAddress::new(3, 0, 0)));
        let sysfs = MockSysfs::healthy();
        let sysfs_counters = sysfs.counters();

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default()
                .with_adl(Box::new(adl))
                .with_sysfs(Box::new(sysfs)),
        )
        .unwrap();

        // reading comes from the native library, the fallback is never read
        assert_eq!(ctx.get_temperature(0), Some(45));
        assert_eq!(sysfs_counters.count("attach"), 0);
        assert_eq!(sysfs_counters.count("temperature"), 0);
        assert_eq!(sysfs_counters.count("close"), 1);
    }

    #[test]
    fn test_sysfs_fallback_readings() {
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_sysfs(Box::new(MockSysfs::healthy())),
        )
        .unwrap();

        assert!(ctx.is_enabled());
        assert_eq!(ctx.get_temperature(0), Some(61));
        assert_eq!(ctx.get_fan_speed(0), Some(35));
        assert_eq!(ctx.get_core_clock(0), Some(1450));
        assert_eq!(ctx.get_memory_clock(0), Some(1750));
        assert_eq!(ctx.get_bus_lanes(0), Some(16));
        assert_eq!(ctx.get_utilization(0), Some(73));
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));
        assert_eq!(ctx.get_threshold_slowdown(0), None);
        assert_eq!(ctx.get_throttle(0), None);
    }

    #[test]
    fn test_mixed_vendor_rig() {
        let nv_pcie = PcieAddress::new(1, 0, 0);
        let amd_pcie = PcieAddress::new(3, 0, 0);
        let backends = VendorBackends::default()
            .with_nvml(Box::new(
                MockNvml::new().with_device(MockNvmlDevice::healthy(nv_pcie)),
            ))
            .with_adl(Box::new(
                MockAdl::new().with_adapter(MockAdlAdapter::healthy_od5(amd_pcie)),
            ));

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[nv_device(0, 1), amd_device(1, 3)],
            backends,
        )
        .unwrap();

        assert_eq!(ctx.get_temperature(0), Some(72));
        assert_eq!(ctx.get_temperature(1), Some(45));
        assert_eq!(ctx.get_throttle(1), None);
    }

    #[test]
    fn test_failed_enumeration_is_soft() {
        let nvml = MockNvml::new()
            .with_device(MockNvmlDevice::healthy(PcieAddress::new(1, 0, 0)))
            .with_failing_enumeration();

        let ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvml(Box::new(nvml)),
        )
        .unwrap();
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn test_failed_sysfs_attach_fails_closed_at_warm_up() {
        let sysfs = MockSysfs::healthy().with_failing_attach();
        let counters = sysfs.counters();

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_sysfs(Box::new(sysfs)),
        )
        .unwrap();

        // warm-up disabled every file-backed capability on the first read;
        // only the synthesized fan policy survives
        assert_eq!(ctx.get_temperature(0), None);
        assert_eq!(ctx.get_utilization(0), None);
        assert_eq!(counters.count("temperature"), 1);
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));
        assert_eq!(ctx.device_record(0).unwrap().caps.usable_count(), 1);
    }

    #[test]
    fn test_failing_throttle_probe_disables_only_throttle() {
        let pcie = PcieAddress::new(1, 0, 0);
        let backends = VendorBackends::default()
            .with_nvml(Box::new(
                MockNvml::new().with_device(MockNvmlDevice::healthy(pcie)),
            ))
            .with_nvapi(Box::new(MockNvapi::new().with_failing_gpu(pcie)));

        let mut ctx =
            HwmonContext::init(&HwmonConfig::default(), &[nv_device(0, 1)], backends).unwrap();

        assert_eq!(ctx.get_throttle(0), None);
        assert_eq!(ctx.get_temperature(0), Some(72));
        assert_eq!(ctx.get_fan_policy(0), Some(FAN_POLICY_AUTOMATIC));
    }

    #[test]
    fn test_out_of_range_index() {
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_sysfs(Box::new(MockSysfs::healthy())),
        )
        .unwrap();
        assert_eq!(ctx.get_temperature(7), None);
    }

    #[test]
    fn test_destroy_is_idempotent_and_resets() {
        let nvml = MockNvml::new().with_device(MockNvmlDevice::healthy(PcieAddress::new(1, 0, 0)));
        let counters = nvml.counters();

        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[nv_device(0, 1)],
            VendorBackends::default().with_nvml(Box::new(nvml)),
        )
        .unwrap();
        assert!(ctx.is_enabled());

        ctx.destroy();
        assert!(!ctx.is_enabled());
        assert_eq!(ctx.get_temperature(0), None);
        assert!(ctx.saved_clock_state().is_empty());

        ctx.destroy();
        assert_eq!(counters.count("close"), 1);
    }

    #[test]
    fn test_saved_clock_state_buffer() {
        let mut ctx = HwmonContext::init(
            &HwmonConfig::default(),
            &[amd_device(0, 3)],
            VendorBackends::default().with_sysfs(Box::new(MockSysfs::healthy())),
        )
        .unwrap();

        assert_eq!(ctx.saved_clock_state().len(), 1);
        ctx.saved_clock_state_mut()[0] = SavedMemClockState {
            engine_clock: 1250,
            memory_clock: 1500,
        };
        assert_eq!(ctx.saved_clock_state()[0].memory_clock, 1500);
    }
}
