//! dynamig-driver: Device driver boundary
//!
//! This crate provides the capability surface the partition manager drives:
//! - The `DeviceDriver` trait and the tagged `CreateOutcome`
//! - An in-memory simulated driver for dry runs and tests
//! - An NVML backend for NVIDIA GPUs (feature `nvml`)

pub mod simulated;
pub mod traits;

#[cfg(feature = "nvml")]
pub mod nvml;

#[cfg(feature = "nvml")]
pub use nvml::NvmlDriver;
pub use simulated::SimulatedDriver;
pub use traits::{CreateOutcome, DeviceDriver, SHARED_ENGINE_SLOT};
