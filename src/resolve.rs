//! Device-identity resolution.
//!
//! Correlates each compute device with at most one adapter handle per
//! loaded vendor family by exact match on the physical PCIe triple, then
//! merges the per-family support tables into one capability record per
//! device and fixes the dispatch route for every capability.

use tracing::{debug, warn};

use crate::backend::{AdlHandle, NvapiHandle, NvmlHandle, VendorBackends};
use crate::capability::{Capability, DeviceRecord, DispatchInfo, Route, CAP_COUNT};
use crate::device::{ComputeDevice, RuntimeKind};
use crate::{HwmonError, Result};

/// Capabilities the NVIDIA management family generally supports.
const NVML_CAPS: [Capability; 8] = [
    Capability::Temperature,
    Capability::FanSpeed,
    Capability::Utilization,
    Capability::CoreClock,
    Capability::MemoryClock,
    Capability::BusLanes,
    Capability::ThresholdSlowdown,
    Capability::ThresholdShutdown,
];

/// Capabilities the NVIDIA low-level family generally supports.
const NVAPI_CAPS: [Capability; 2] = [Capability::FanPolicy, Capability::Throttle];

/// Capabilities the AMD native family generally supports.
const ADL_CAPS: [Capability; 8] = [
    Capability::Temperature,
    Capability::FanSpeed,
    Capability::FanPolicy,
    Capability::Utilization,
    Capability::CoreClock,
    Capability::MemoryClock,
    Capability::BusLanes,
    Capability::ThresholdSlowdown,
];

/// Capabilities the OS-file-based family generally supports.
const SYSFS_CAPS: [Capability; 7] = [
    Capability::Temperature,
    Capability::FanSpeed,
    Capability::FanPolicy,
    Capability::Utilization,
    Capability::CoreClock,
    Capability::MemoryClock,
    Capability::BusLanes,
];

pub(crate) struct Resolution {
    pub records: Vec<Option<DeviceRecord>>,
    /// Whether any hardware-backed family (AMD-native, NVIDIA-management,
    /// OS-file-based) produced a usable mapping.
    pub hardware_backed: bool,
}

/// Whether a device is eligible for the NVIDIA handle sets.
fn wants_nvidia(device: &ComputeDevice) -> bool {
    match device.runtime {
        RuntimeKind::Cuda => true,
        RuntimeKind::OpenCl => device.is_gpu() && device.is_nvidia(),
    }
}

/// Whether a device is eligible for the AMD handle sets.
fn wants_amd(device: &ComputeDevice) -> bool {
    device.runtime == RuntimeKind::OpenCl && device.is_gpu() && device.is_amd()
}

pub(crate) fn resolve(
    devices: &[ComputeDevice],
    backends: &mut VendorBackends,
) -> Result<Resolution> {
    let len = devices.len();
    let mut nvml_match: Vec<Option<NvmlHandle>> = vec![None; len];
    let mut nvapi_match: Vec<Option<NvapiHandle>> = vec![None; len];
    let mut adl_match: Vec<Option<(AdlHandle, i32)>> = vec![None; len];
    let mut sysfs_match: Vec<bool> = vec![false; len];

    let active = |d: &&ComputeDevice| !d.skipped && d.index < len;

    if let Some(nvml) = backends.nvml.as_deref() {
        match nvml.device_handles() {
            Ok(handles) => {
                if handles.is_empty() {
                    warn!("no NVML adapters found");
                }
                for device in devices.iter().filter(active).filter(|d| wants_nvidia(d)) {
                    for &handle in &handles {
                        let Ok(pcie) = nvml.pcie_address(handle) else {
                            continue;
                        };
                        if pcie == device.pcie {
                            debug!(device = device.index, handle = handle.0, "NVML match");
                            nvml_match[device.index] = Some(handle);
                        }
                    }
                }
            }
            Err(err) => warn!("NVML enumeration failed: {err}"),
        }
    }

    if let Some(nvapi) = backends.nvapi.as_deref() {
        match nvapi.gpu_handles() {
            Ok(handles) => {
                if handles.is_empty() {
                    warn!("no NvAPI adapters found");
                }
                for device in devices.iter().filter(active).filter(|d| wants_nvidia(d)) {
                    for &handle in &handles {
                        let Ok(pcie) = nvapi.pcie_address(handle) else {
                            continue;
                        };
                        if pcie == device.pcie {
                            debug!(device = device.index, handle = handle.0, "NvAPI match");
                            nvapi_match[device.index] = Some(handle);
                        }
                    }
                }
            }
            Err(err) => warn!("NvAPI enumeration failed: {err}"),
        }
    }

    if let Some(adl) = backends.adl.as_deref() {
        // Without the adapter-info table device identity cannot be
        // established at all, so this failure is not a soft one.
        let adapters = adl
            .adapter_info()
            .map_err(|err| HwmonError::AdapterInfo(err.to_string()))?;
        if adapters.is_empty() {
            warn!("no ADL adapters found");
        }
        for device in devices.iter().filter(active).filter(|d| wants_amd(d)) {
            for adapter in &adapters {
                if adapter.pcie == device.pcie {
                    let od_version = adl
                        .overdrive_caps(adapter.handle)
                        .map(|caps| caps.version)
                        .unwrap_or(0);
                    debug!(
                        device = device.index,
                        handle = adapter.handle.0,
                        od_version,
                        "ADL match"
                    );
                    adl_match[device.index] = Some((adapter.handle, od_version));
                }
            }
        }
    }

    if let Some(sysfs) = backends.sysfs.as_deref_mut() {
        // The OS-file family carries no enumerable handles; every portable
        // AMD GPU device is assigned to it and broken reads fail closed at
        // warm-up.
        for device in devices.iter().filter(active).filter(|d| wants_amd(d)) {
            if let Err(err) = sysfs.attach(device) {
                debug!(device = device.index, "sysfs attach failed: {err}");
            }
            sysfs_match[device.index] = true;
        }
    }

    let hardware_backed = nvml_match.iter().any(Option::is_some)
        || adl_match.iter().any(Option::is_some)
        || sysfs_match.iter().any(|m| *m);

    let mut records: Vec<Option<DeviceRecord>> = Vec::with_capacity(len);
    records.resize_with(len, || None);
    for device in devices.iter().filter(active) {
        let idx = device.index;
        records[idx] = Some(build_record(
            device,
            nvml_match[idx],
            nvapi_match[idx],
            adl_match[idx],
            sysfs_match[idx],
        ));
    }

    Ok(Resolution {
        records,
        hardware_backed,
    })
}

/// Merge one device's per-family matches into its final record.
fn build_record(
    device: &ComputeDevice,
    nvml: Option<NvmlHandle>,
    nvapi: Option<NvapiHandle>,
    adl: Option<(AdlHandle, i32)>,
    sysfs: bool,
) -> DeviceRecord {
    let mut dispatch = DispatchInfo::unrouted(device.index);
    let od_version = adl.map(|(_, od)| od).unwrap_or(0);

    let nvidia = wants_nvidia(device);
    let amd = wants_amd(device);

    if nvidia {
        dispatch.nvml = nvml;
        dispatch.nvapi = nvapi;
    }
    if amd {
        dispatch.adl = adl.map(|(handle, _)| handle);
    }
    dispatch.set_routes(compute_routes(
        nvidia,
        amd,
        od_version,
        dispatch.nvml.is_some(),
        dispatch.nvapi.is_some(),
        dispatch.adl.is_some(),
        amd && sysfs,
    ));

    let mut record = DeviceRecord::new(dispatch, od_version);

    if nvidia && nvml.is_some() {
        for cap in NVML_CAPS {
            record.caps.grant(cap);
        }
    }
    if nvidia && nvapi.is_some() {
        for cap in NVAPI_CAPS {
            record.caps.grant(cap);
        }
    }
    if amd && adl.is_some() {
        for cap in ADL_CAPS {
            record.caps.grant(cap);
        }
    }
    if amd && adl.is_none() && sysfs {
        for cap in SYSFS_CAPS {
            record.caps.grant(cap);
        }
    }

    record
}

/// Fix the vendor path for every capability of one device.
///
/// Exactly one backend answers per (device, capability); the AMD native
/// family takes precedence over the OS-file fallback, and overdrive
/// version 6 semantics win over version 5 where both could apply.
#[allow(clippy::too_many_arguments)]
fn compute_routes(
    nvidia: bool,
    amd: bool,
    od_version: i32,
    has_nvml: bool,
    has_nvapi: bool,
    has_adl: bool,
    has_sysfs: bool,
) -> [Route; CAP_COUNT] {
    let mut routes = [Route::None; CAP_COUNT];
    let mut set = |cap: Capability, route: Route| {
        routes[cap as usize] = route;
    };

    if nvidia {
        if has_nvml {
            for cap in NVML_CAPS {
                set(cap, Route::Nvml);
            }
        }
        // No finer policy signal exists on NVIDIA; reads as automatic.
        set(Capability::FanPolicy, Route::FanAuto);
        if has_nvapi {
            set(Capability::Throttle, Route::Nvapi);
        }
        // Throttle via the management API is deliberately not routed: its
        // throttle-reason bitmask also trips on unrelated workload phases.
    }

    if amd {
        if has_adl {
            let (temp, fan, policy) = match od_version {
                5 => (Route::AdlOd5, Route::AdlOd5, Route::AdlOd5),
                6 => (Route::AdlOd6, Route::AdlOd6, Route::FanAuto),
                _ => (Route::None, Route::None, Route::None),
            };
            set(Capability::Temperature, temp);
            set(Capability::FanSpeed, fan);
            set(Capability::FanPolicy, policy);
            set(Capability::Utilization, Route::Adl);
            set(Capability::CoreClock, Route::Adl);
            set(Capability::MemoryClock, Route::Adl);
            set(Capability::BusLanes, Route::Adl);
            // Overdrive 5 has no threshold queries; Overdrive 6 has no
            // shutdown-threshold query. Both stay unrouted on purpose.
            if od_version == 6 {
                set(Capability::ThresholdSlowdown, Route::AdlOd6);
            }
        } else if has_sysfs {
            set(Capability::Temperature, Route::Sysfs);
            set(Capability::FanSpeed, Route::Sysfs);
            set(Capability::FanPolicy, Route::FanAuto);
            set(Capability::Utilization, Route::Sysfs);
            set(Capability::CoreClock, Route::Sysfs);
            set(Capability::MemoryClock, Route::Sysfs);
            set(Capability::BusLanes, Route::Sysfs);
        }
        // No AMD throttle signal is implemented.
    }

    routes
}
