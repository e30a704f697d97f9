//! OS-file-based AMD backend over the Linux amdgpu driver's sysfs tree.
//!
//! Telemetry lives in two places per device: the PCI device directory
//! (`pp_dpm_sclk`, `pp_dpm_mclk`, `pp_dpm_pcie`, `gpu_busy_percent`) and
//! its `hwmon` subdirectory (`temp1_input`, `pwm1`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::SysfsBackend;
use crate::device::ComputeDevice;
use crate::{HwmonError, Result};

const DEFAULT_ROOT: &str = "/sys/bus/pci/devices";

#[derive(Debug, Clone)]
struct DevicePaths {
    device_dir: PathBuf,
    hwmon_dir: PathBuf,
}

/// Telemetry reader over the amdgpu sysfs files, keyed by compute-device
/// index.
#[derive(Debug)]
pub struct SysfsAmdGpu {
    root: PathBuf,
    devices: HashMap<usize, DevicePaths>,
}

impl SysfsAmdGpu {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// Use an alternate root, e.g. from the `sysfs_root` backend option.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            devices: HashMap::new(),
        }
    }

    fn paths(&self, device_index: usize) -> Result<&DevicePaths> {
        self.devices.get(&device_index).ok_or_else(|| {
            HwmonError::Unavailable(format!("device {device_index} has no sysfs mapping"))
        })
    }

    fn read_value(&self, path: &Path) -> Result<i64> {
        let text = fs::read_to_string(path)?;
        text.trim()
            .parse()
            .map_err(|_| HwmonError::Probe(format!("malformed value in {}", path.display())))
    }
}

impl Default for SysfsAmdGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsBackend for SysfsAmdGpu {
    fn attach(&mut self, device: &ComputeDevice) -> Result<()> {
        let device_dir = self.root.join(format!(
            "0000:{:02x}:{:02x}.{}",
            device.pcie.bus, device.pcie.device, device.pcie.function
        ));
        // hwmon subdirectory name is kernel-assigned (hwmonN)
        let hwmon_dir = fs::read_dir(device_dir.join("hwmon"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .next()
            .ok_or_else(|| {
                HwmonError::Unavailable(format!("no hwmon directory under {}", device_dir.display()))
            })?;
        debug!(device = device.index, path = %device_dir.display(), "sysfs mapping");
        self.devices.insert(
            device.index,
            DevicePaths {
                device_dir,
                hwmon_dir,
            },
        );
        Ok(())
    }

    fn temperature(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        // milli-degrees
        Ok(self.read_value(&paths.hwmon_dir.join("temp1_input"))? / 1000)
    }

    fn fan_speed(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        let pwm = self.read_value(&paths.hwmon_dir.join("pwm1"))?;
        let pwm_max = self
            .read_value(&paths.hwmon_dir.join("pwm1_max"))
            .unwrap_or(255);
        if pwm_max <= 0 {
            return Err(HwmonError::Probe("pwm1_max reports zero range".into()));
        }
        Ok(pwm * 100 / pwm_max)
    }

    fn core_clock(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        parse_dpm_clock(&fs::read_to_string(paths.device_dir.join("pp_dpm_sclk"))?)
    }

    fn memory_clock(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        parse_dpm_clock(&fs::read_to_string(paths.device_dir.join("pp_dpm_mclk"))?)
    }

    fn bus_lanes(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        parse_dpm_lanes(&fs::read_to_string(paths.device_dir.join("pp_dpm_pcie"))?)
    }

    fn utilization(&self, device_index: usize) -> Result<i64> {
        let paths = self.paths(device_index)?;
        self.read_value(&paths.device_dir.join("gpu_busy_percent"))
    }

    fn close(&mut self) {
        self.devices.clear();
    }
}

/// Extract the active level's clock in MHz from a `pp_dpm_{s,m}clk` table.
///
/// The driver marks the active performance level with a trailing `*`:
///
/// ```text
/// 0: 300Mhz
/// 1: 800Mhz *
/// 2: 1500Mhz
/// ```
fn parse_dpm_clock(table: &str) -> Result<i64> {
    for line in table.lines() {
        if !line.trim_end().ends_with('*') {
            continue;
        }
        let Some((_, rest)) = line.split_once(':') else {
            continue;
        };
        let digits: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return digits
                .parse()
                .map_err(|_| HwmonError::Probe("malformed dpm clock table".into()));
        }
    }
    Err(HwmonError::Probe("no active dpm performance level".into()))
}

/// Extract the active lane count from a `pp_dpm_pcie` table, where lanes
/// appear as `xN` in the active line (`1: 8.0GT/s, x16 *`).
fn parse_dpm_lanes(table: &str) -> Result<i64> {
    for line in table.lines() {
        if !line.trim_end().ends_with('*') {
            continue;
        }
        let Some(pos) = line.rfind('x') else {
            continue;
        };
        let digits: String = line[pos + 1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return digits
                .parse()
                .map_err(|_| HwmonError::Probe("malformed dpm pcie table".into()));
        }
    }
    Err(HwmonError::Probe("no active dpm pcie level".into()))
}
