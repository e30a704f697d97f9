//! Per-device capability bookkeeping.
//!
//! Every telemetry operation is tracked per device by an explicit
//! three-state machine: `Untested` until the first probe, then either
//! `Supported` or permanently `Disabled`. A capability that fails once is
//! never probed again for the rest of the run.

use serde::{Deserialize, Serialize};

use crate::backend::{AdlHandle, NvapiHandle, NvmlHandle};

/// Number of tracked telemetry operations.
pub const CAP_COUNT: usize = 10;

/// One telemetry read operation whose availability is tracked per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Temperature,
    FanSpeed,
    FanPolicy,
    Utilization,
    CoreClock,
    MemoryClock,
    BusLanes,
    ThresholdSlowdown,
    ThresholdShutdown,
    Throttle,
}

impl Capability {
    pub const ALL: [Capability; CAP_COUNT] = [
        Capability::Temperature,
        Capability::FanSpeed,
        Capability::FanPolicy,
        Capability::Utilization,
        Capability::CoreClock,
        Capability::MemoryClock,
        Capability::BusLanes,
        Capability::ThresholdSlowdown,
        Capability::ThresholdShutdown,
        Capability::Throttle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::Temperature => "temperature",
            Capability::FanSpeed => "fan_speed",
            Capability::FanPolicy => "fan_policy",
            Capability::Utilization => "utilization",
            Capability::CoreClock => "core_clock",
            Capability::MemoryClock => "memory_clock",
            Capability::BusLanes => "bus_lanes",
            Capability::ThresholdSlowdown => "threshold_slowdown",
            Capability::ThresholdShutdown => "threshold_shutdown",
            Capability::Throttle => "throttle",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Probe state of one (device, capability) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapState {
    /// Granted at resolution time but not yet probed.
    Untested,
    /// At least one probe succeeded and none has failed since.
    Supported,
    /// Never granted, or a probe failed; permanent for the run.
    Disabled,
}

/// Capability states for one device.
///
/// Starts all-`Disabled`; identity resolution grants capabilities a vendor
/// family generally supports, after which the only allowed transitions are
/// `Untested -> Supported`, `Untested -> Disabled` and
/// `Supported -> Disabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySet {
    states: [CapState; CAP_COUNT],
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            states: [CapState::Disabled; CAP_COUNT],
        }
    }
}

impl CapabilitySet {
    pub fn state(&self, cap: Capability) -> CapState {
        self.states[cap.index()]
    }

    /// Mark a capability as generally supported by a resolved vendor
    /// family. Only called during identity resolution.
    pub(crate) fn grant(&mut self, cap: Capability) {
        self.states[cap.index()] = CapState::Untested;
    }

    /// Record a successful probe.
    pub(crate) fn note_success(&mut self, cap: Capability) {
        if self.states[cap.index()] == CapState::Untested {
            self.states[cap.index()] = CapState::Supported;
        }
    }

    /// Permanently revoke a capability.
    pub(crate) fn disable(&mut self, cap: Capability) {
        self.states[cap.index()] = CapState::Disabled;
    }

    pub fn is_disabled(&self, cap: Capability) -> bool {
        self.state(cap) == CapState::Disabled
    }

    /// Number of capabilities not (yet) disabled.
    pub fn usable_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s != CapState::Disabled)
            .count()
    }
}

/// Concrete vendor path chosen for one (device, capability) pair at
/// resolution time.
///
/// Accessors dispatch on this directly instead of re-deriving the
/// runtime-kind/vendor-id branching on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// NVIDIA management library.
    Nvml,
    /// NVIDIA low-level driver API.
    Nvapi,
    /// AMD native library, Overdrive 5 entry points.
    AdlOd5,
    /// AMD native library, Overdrive 6 entry points.
    AdlOd6,
    /// AMD native library, overdrive-version-independent activity block.
    Adl,
    /// Linux amdgpu sysfs files.
    Sysfs,
    /// No finer vendor signal exists; fan policy reads as automatic.
    FanAuto,
    /// No backend can answer; the first access fail-closes the capability.
    None,
}

/// Resolution output needed to dispatch an accessor without re-matching.
#[derive(Debug, Clone, Copy)]
pub struct DispatchInfo {
    pub device_index: usize,
    pub nvml: Option<NvmlHandle>,
    pub nvapi: Option<NvapiHandle>,
    pub adl: Option<AdlHandle>,
    routes: [Route; CAP_COUNT],
}

impl DispatchInfo {
    pub(crate) fn unrouted(device_index: usize) -> Self {
        Self {
            device_index,
            nvml: None,
            nvapi: None,
            adl: None,
            routes: [Route::None; CAP_COUNT],
        }
    }

    pub(crate) fn set_routes(&mut self, routes: [Route; CAP_COUNT]) {
        self.routes = routes;
    }

    pub fn route(&self, cap: Capability) -> Route {
        self.routes[cap.index()]
    }
}

/// Per-device record: capability states plus the resolved vendor identity.
#[derive(Debug)]
pub struct DeviceRecord {
    pub caps: CapabilitySet,
    /// AMD overdrive generation marker (0 when not an ADL device).
    pub od_version: i32,
    pub(crate) dispatch: DispatchInfo,
}

impl DeviceRecord {
    pub(crate) fn new(dispatch: DispatchInfo, od_version: i32) -> Self {
        Self {
            caps: CapabilitySet::default(),
            od_version,
            dispatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_starts_disabled() {
        let caps = CapabilitySet::default();
        for cap in Capability::ALL {
            assert_eq!(caps.state(cap), CapState::Disabled);
        }
        assert_eq!(caps.usable_count(), 0);
    }

    #[test]
    fn test_untested_to_supported() {
        let mut caps = CapabilitySet::default();
        caps.grant(Capability::Temperature);
        assert_eq!(caps.state(Capability::Temperature), CapState::Untested);

        caps.note_success(Capability::Temperature);
        assert_eq!(caps.state(Capability::Temperature), CapState::Supported);

        // further successes are idempotent
        caps.note_success(Capability::Temperature);
        assert_eq!(caps.state(Capability::Temperature), CapState::Supported);
    }

    #[test]
    fn test_disable_is_permanent() {
        let mut caps = CapabilitySet::default();
        caps.grant(Capability::FanSpeed);
        caps.disable(Capability::FanSpeed);
        assert!(caps.is_disabled(Capability::FanSpeed));

        // a late success report must not revive a disabled capability
        caps.note_success(Capability::FanSpeed);
        assert!(caps.is_disabled(Capability::FanSpeed));
    }

    #[test]
    fn test_usable_count_shrinks_only() {
        let mut caps = CapabilitySet::default();
        for cap in Capability::ALL {
            caps.grant(cap);
        }
        assert_eq!(caps.usable_count(), CAP_COUNT);

        caps.disable(Capability::Throttle);
        caps.disable(Capability::BusLanes);
        assert_eq!(caps.usable_count(), CAP_COUNT - 2);
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::Temperature.to_string(), "temperature");
        assert_eq!(Capability::ThresholdSlowdown.to_string(), "threshold_slowdown");
        assert_eq!(Capability::ALL.len(), CAP_COUNT);
    }
}
