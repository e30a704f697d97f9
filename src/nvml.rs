//! NVIDIA management backend over the real driver library.

use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor, TemperatureThreshold};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::debug;

use crate::backend::{ClockKind, NvmlBackend, NvmlHandle, ThresholdKind};
use crate::device::PcieAddress;
use crate::{HwmonError, Result};

fn probe_err(err: NvmlError) -> HwmonError {
    HwmonError::Probe(err.to_string())
}

/// Live NVML session. Handles are plain device indices.
pub struct NvmlLib {
    nvml: Nvml,
}

impl NvmlLib {
    pub fn load() -> Result<Self> {
        let nvml = Nvml::init()
            .map_err(|err| HwmonError::Unavailable(format!("NVML init failed: {err}")))?;
        debug!("NVML session initialized");
        Ok(Self { nvml })
    }

    fn device(&self, handle: NvmlHandle) -> Result<nvml_wrapper::Device<'_>> {
        self.nvml.device_by_index(handle.0).map_err(probe_err)
    }
}

impl NvmlBackend for NvmlLib {
    fn device_handles(&self) -> Result<Vec<NvmlHandle>> {
        let count = self.nvml.device_count().map_err(probe_err)?;
        Ok((0..count).map(NvmlHandle).collect())
    }

    fn pcie_address(&self, handle: NvmlHandle) -> Result<PcieAddress> {
        let pci = self.device(handle)?.pci_info().map_err(probe_err)?;
        // the function number only appears in the textual bus id,
        // "domain:bus:device.function"
        let function = pci
            .bus_id
            .rsplit('.')
            .next()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        Ok(PcieAddress::new(pci.bus as u8, pci.device as u8, function))
    }

    fn temperature(&self, handle: NvmlHandle) -> Result<i64> {
        self.device(handle)?
            .temperature(TemperatureSensor::Gpu)
            .map(i64::from)
            .map_err(probe_err)
    }

    fn fan_speed(&self, handle: NvmlHandle) -> Result<i64> {
        self.device(handle)?
            .fan_speed(0)
            .map(i64::from)
            .map_err(probe_err)
    }

    fn clock(&self, handle: NvmlHandle, kind: ClockKind) -> Result<i64> {
        let clock = match kind {
            ClockKind::Core => Clock::SM,
            ClockKind::Memory => Clock::Memory,
        };
        self.device(handle)?
            .clock_info(clock)
            .map(i64::from)
            .map_err(probe_err)
    }

    fn pcie_link_width(&self, handle: NvmlHandle) -> Result<i64> {
        self.device(handle)?
            .current_pcie_link_width()
            .map(i64::from)
            .map_err(probe_err)
    }

    fn utilization(&self, handle: NvmlHandle) -> Result<i64> {
        self.device(handle)?
            .utilization_rates()
            .map(|u| i64::from(u.gpu))
            .map_err(probe_err)
    }

    fn temperature_threshold(&self, handle: NvmlHandle, kind: ThresholdKind) -> Result<i64> {
        let threshold = match kind {
            ThresholdKind::Slowdown => TemperatureThreshold::Slowdown,
            ThresholdKind::Shutdown => TemperatureThreshold::Shutdown,
        };
        self.device(handle)?
            .temperature_threshold(threshold)
            .map(i64::from)
            .map_err(probe_err)
    }
}
