//! GPU hardware telemetry with per-device capability negotiation.
//!
//! Correlates compute devices with the vendor monitoring stacks present on
//! the host (AMD native library, NVIDIA management and low-level APIs,
//! Linux amdgpu sysfs) by exact PCIe (bus, device, function) match, then
//! serves ten unified telemetry readings per device. Capabilities fail
//! closed: a probe that errors once is disabled for the rest of the run,
//! and an initialization warm-up pass surfaces broken probes up front.
//!
//! Vendor libraries are abstracted behind one trait per family, so the
//! embedder decides how to load them and tests run against programmable
//! mocks.
//!
//! ```
//! use gpu_hwmon::{HwmonConfig, HwmonContext, VendorBackends};
//!
//! let config = HwmonConfig::default().with_monitoring_disabled(true);
//! let mut ctx = HwmonContext::init(&config, &[], VendorBackends::default())?;
//! assert!(!ctx.is_enabled());
//! assert_eq!(ctx.get_temperature(0), None);
//! # Ok::<(), gpu_hwmon::HwmonError>(())
//! ```

use thiserror::Error;

pub mod backend;
pub mod capability;
pub mod config;
pub mod context;
pub mod device;
mod resolve;

#[cfg(any(feature = "mock", test))]
pub mod mock;

#[cfg(feature = "nvml")]
pub mod nvml;

#[cfg(all(feature = "sysfs", target_os = "linux"))]
pub mod sysfs;

pub use backend::{
    AdlBackend, AdlHandle, NvapiBackend, NvapiHandle, NvmlBackend, NvmlHandle, SysfsBackend,
    VendorBackends,
};
pub use capability::{CapState, Capability, Route};
pub use config::{HwmonConfig, RunMode};
pub use context::{HwmonContext, SavedMemClockState, FAN_POLICY_AUTOMATIC, FAN_POLICY_MANUAL};
pub use device::{ComputeDevice, PcieAddress, RuntimeKind};

/// Hardware-monitoring errors.
#[derive(Error, Debug)]
pub enum HwmonError {
    /// Adapter enumeration failed; device identity cannot be established.
    #[error("adapter enumeration failed: {0}")]
    AdapterInfo(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A vendor probe returned an error.
    #[error("probe failed: {0}")]
    Probe(String),

    /// No backend can serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HwmonError>;
