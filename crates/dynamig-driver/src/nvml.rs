//! NVML (NVIDIA Management Library) backend
//!
//! Device discovery goes through `nvml-wrapper`. The MIG partitioning calls
//! have no safe wrapper and are issued against the raw `NvmlLib` bindings.

use crate::traits::{CreateOutcome, DeviceDriver};
use dynamig_core::{DeviceIdentity, DeviceSelector, DriverError, Placement};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use nvml_wrapper_sys::bindings::{
    nvmlComputeInstanceInfo_t, nvmlComputeInstanceProfileInfo_t, nvmlComputeInstance_t,
    nvmlDevice_t, nvmlGpuInstanceInfo_t, nvmlGpuInstancePlacement_t,
    nvmlGpuInstanceProfileInfo_t, nvmlGpuInstance_t, nvmlReturn_t, NvmlLib,
};
use std::ffi::{CStr, OsStr};
use std::os::raw::c_char;
use std::path::Path;
use tracing::{debug, info};

#[cfg(target_os = "windows")]
const DEFAULT_LIBRARY: &str = "nvml.dll";
#[cfg(not(target_os = "windows"))]
const DEFAULT_LIBRARY: &str = "libnvidia-ml.so.1";

const NVML_SUCCESS: nvmlReturn_t = 0;
const NVML_ERROR_INVALID_ARGUMENT: nvmlReturn_t = 2;
const NVML_ERROR_NOT_FOUND: nvmlReturn_t = 6;
const NVML_ERROR_INSUFFICIENT_RESOURCES: nvmlReturn_t = 23;
const NVML_ERROR_UNKNOWN: nvmlReturn_t = 999;

const NVML_DEVICE_MIG_ENABLE: u32 = 1;
const STRING_BUFFER_SIZE: usize = 96;

/// Raw NVML device handle
#[derive(Debug, Clone, Copy)]
pub struct NvmlDevice(nvmlDevice_t);

/// Raw NVML GPU instance handle
#[derive(Debug, Clone, Copy)]
pub struct NvmlGpuInstance(nvmlGpuInstance_t);

/// Raw NVML compute instance handle
#[derive(Debug, Clone, Copy)]
pub struct NvmlComputeInstance(nvmlComputeInstance_t);

/// Compute instance profile resolved inside a GPU instance
#[derive(Debug, Clone, Copy)]
pub struct NvmlComputeProfile {
    /// Driver-assigned profile id used for creation
    pub id: u32,
    /// Maximum compute instances of this profile per GPU instance
    pub instance_count: u32,
}

/// Driver backed by the system NVML library
pub struct NvmlDriver {
    nvml: Nvml,
    lib: NvmlLib,
}

fn check(ret: nvmlReturn_t) -> Result<(), DriverError> {
    match ret {
        NVML_SUCCESS => Ok(()),
        NVML_ERROR_NOT_FOUND => Err(DriverError::NotFound),
        NVML_ERROR_INSUFFICIENT_RESOURCES => Err(DriverError::InsufficientResources),
        code => Err(DriverError::rejected(code, status_name(code))),
    }
}

fn status_name(code: nvmlReturn_t) -> &'static str {
    match code {
        1 => "NVML not initialized",
        NVML_ERROR_INVALID_ARGUMENT => "invalid argument",
        3 => "not supported",
        4 => "no permission",
        9 => "driver not loaded",
        15 => "GPU is lost",
        19 => "resource in use",
        _ => "unknown error",
    }
}

fn from_nvml(err: NvmlError) -> DriverError {
    match err {
        NvmlError::NotFound | NvmlError::InvalidArg => DriverError::NotFound,
        other => DriverError::rejected(NVML_ERROR_UNKNOWN, other.to_string()),
    }
}

fn c_string(buf: &[c_char]) -> String {
    // NVML always NUL-terminates within the buffer it was given
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl NvmlDriver {
    /// Initialize NVML, optionally from an explicit library path
    pub fn new(library_path: Option<&Path>) -> Result<Self, DriverError> {
        let path: &OsStr = library_path
            .map(Path::as_os_str)
            .unwrap_or_else(|| OsStr::new(DEFAULT_LIBRARY));

        let nvml = match library_path {
            Some(_) => Nvml::builder().lib_path(path).init(),
            None => Nvml::init(),
        }
        .map_err(from_nvml)?;

        let lib = unsafe { NvmlLib::new(path) }
            .map_err(|e| DriverError::rejected(NVML_ERROR_UNKNOWN, e.to_string()))?;

        info!(library = %path.to_string_lossy(), "NVML initialized");

        Ok(Self { nvml, lib })
    }

    fn uuid_of(&self, device: nvmlDevice_t) -> Result<DeviceIdentity, DriverError> {
        let mut buf = [0 as c_char; STRING_BUFFER_SIZE];
        check(unsafe {
            self.lib
                .nvmlDeviceGetUUID(device, buf.as_mut_ptr(), STRING_BUFFER_SIZE as u32)
        })?;
        Ok(DeviceIdentity::new(c_string(&buf)))
    }

    fn instance_info(&self, instance: &NvmlGpuInstance) -> Result<nvmlGpuInstanceInfo_t, DriverError> {
        let mut info: nvmlGpuInstanceInfo_t = unsafe { std::mem::zeroed() };
        check(unsafe { self.lib.nvmlGpuInstanceGetInfo(instance.0, &mut info) })?;
        Ok(info)
    }

    fn gi_profile_info(
        &self,
        device: nvmlDevice_t,
        gi_template: u32,
    ) -> Result<nvmlGpuInstanceProfileInfo_t, DriverError> {
        let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
        check(unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceProfileInfo(device, gi_template, &mut info)
        })?;
        Ok(info)
    }
}

impl DeviceDriver for NvmlDriver {
    type Device = NvmlDevice;
    type Instance = NvmlGpuInstance;
    type SubInstance = NvmlComputeInstance;
    type SubTemplate = NvmlComputeProfile;

    fn name(&self) -> &'static str {
        "nvml"
    }

    fn device_count(&self) -> Result<u32, DriverError> {
        self.nvml.device_count().map_err(from_nvml)
    }

    fn device(&self, selector: &DeviceSelector) -> Result<NvmlDevice, DriverError> {
        let device = match selector {
            DeviceSelector::Index(index) => self.nvml.device_by_index(*index),
            DeviceSelector::Uuid(uuid) => self.nvml.device_by_uuid(uuid.as_str()),
        }
        .map_err(from_nvml)?;
        Ok(NvmlDevice(unsafe { device.handle() }))
    }

    fn device_identity(&self, device: &NvmlDevice) -> Result<DeviceIdentity, DriverError> {
        self.uuid_of(device.0)
    }

    fn device_name(&self, device: &NvmlDevice) -> Result<String, DriverError> {
        let mut buf = [0 as c_char; STRING_BUFFER_SIZE];
        check(unsafe {
            self.lib
                .nvmlDeviceGetName(device.0, buf.as_mut_ptr(), STRING_BUFFER_SIZE as u32)
        })?;
        Ok(c_string(&buf))
    }

    fn mig_enabled(&self, device: &NvmlDevice) -> Result<bool, DriverError> {
        let mut current = 0u32;
        let mut pending = 0u32;
        check(unsafe {
            self.lib
                .nvmlDeviceGetMigMode(device.0, &mut current, &mut pending)
        })?;
        Ok(current == NVML_DEVICE_MIG_ENABLE)
    }

    fn create_instance(
        &self,
        device: &NvmlDevice,
        gi_template: u32,
        placement: Placement,
    ) -> CreateOutcome<NvmlGpuInstance> {
        let result = self.gi_profile_info(device.0, gi_template).and_then(|profile| {
            let raw_placement = nvmlGpuInstancePlacement_t {
                start: placement.start,
                size: placement.size,
            };
            let mut instance: nvmlGpuInstance_t = std::ptr::null_mut();
            debug!(
                profile_id = profile.id,
                start = placement.start,
                size = placement.size,
                "Creating GPU instance"
            );
            check(unsafe {
                self.lib.nvmlDeviceCreateGpuInstanceWithPlacement(
                    device.0,
                    profile.id,
                    &raw_placement,
                    &mut instance,
                )
            })?;
            Ok(NvmlGpuInstance(instance))
        });
        CreateOutcome::from_result(result)
    }

    fn list_instances(
        &self,
        device: &NvmlDevice,
        gi_template: u32,
    ) -> Result<Vec<NvmlGpuInstance>, DriverError> {
        let profile = self.gi_profile_info(device.0, gi_template)?;
        let mut instances: Vec<nvmlGpuInstance_t> =
            vec![std::ptr::null_mut(); profile.instanceCount as usize];
        let mut count = 0u32;
        check(unsafe {
            self.lib.nvmlDeviceGetGpuInstances(
                device.0,
                profile.id,
                instances.as_mut_ptr(),
                &mut count,
            )
        })?;
        instances.truncate(count as usize);
        Ok(instances.into_iter().map(NvmlGpuInstance).collect())
    }

    fn instance_id(&self, instance: &NvmlGpuInstance) -> Result<u32, DriverError> {
        Ok(self.instance_info(instance)?.id)
    }

    fn instance_placement(&self, instance: &NvmlGpuInstance) -> Result<Placement, DriverError> {
        let info = self.instance_info(instance)?;
        Ok(Placement::new(info.placement.start, info.placement.size))
    }

    fn instance_parent(&self, instance: &NvmlGpuInstance) -> Result<DeviceIdentity, DriverError> {
        let info = self.instance_info(instance)?;
        self.uuid_of(info.device)
    }

    fn instance_by_id(&self, device: &NvmlDevice, id: u32) -> Result<NvmlGpuInstance, DriverError> {
        let mut instance: nvmlGpuInstance_t = std::ptr::null_mut();
        check(unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceById(device.0, id, &mut instance)
        })?;
        Ok(NvmlGpuInstance(instance))
    }

    fn sub_template_info(
        &self,
        instance: &NvmlGpuInstance,
        ci_template: u32,
        engine_slot: u32,
    ) -> Result<NvmlComputeProfile, DriverError> {
        let mut info: nvmlComputeInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
        check(unsafe {
            self.lib.nvmlGpuInstanceGetComputeInstanceProfileInfo(
                instance.0,
                ci_template,
                engine_slot,
                &mut info,
            )
        })?;
        Ok(NvmlComputeProfile {
            id: info.id,
            instance_count: info.instanceCount,
        })
    }

    fn create_sub_instance(
        &self,
        instance: &NvmlGpuInstance,
        template: &NvmlComputeProfile,
    ) -> CreateOutcome<NvmlComputeInstance> {
        let mut compute: nvmlComputeInstance_t = std::ptr::null_mut();
        let ret = unsafe {
            self.lib
                .nvmlGpuInstanceCreateComputeInstance(instance.0, template.id, &mut compute)
        };
        CreateOutcome::from_result(check(ret).map(|_| NvmlComputeInstance(compute)))
    }

    fn list_sub_instances(
        &self,
        instance: &NvmlGpuInstance,
        template: &NvmlComputeProfile,
    ) -> Result<Vec<NvmlComputeInstance>, DriverError> {
        let mut computes: Vec<nvmlComputeInstance_t> =
            vec![std::ptr::null_mut(); template.instance_count as usize];
        let mut count = 0u32;
        check(unsafe {
            self.lib.nvmlGpuInstanceGetComputeInstances(
                instance.0,
                template.id,
                computes.as_mut_ptr(),
                &mut count,
            )
        })?;
        computes.truncate(count as usize);
        Ok(computes.into_iter().map(NvmlComputeInstance).collect())
    }

    fn sub_instance_id(&self, sub_instance: &NvmlComputeInstance) -> Result<u32, DriverError> {
        let mut info: nvmlComputeInstanceInfo_t = unsafe { std::mem::zeroed() };
        check(unsafe {
            self.lib
                .nvmlComputeInstanceGetInfo_v2(sub_instance.0, &mut info)
        })?;
        Ok(info.id)
    }

    fn sub_instance_by_id(
        &self,
        instance: &NvmlGpuInstance,
        id: u32,
    ) -> Result<NvmlComputeInstance, DriverError> {
        let mut compute: nvmlComputeInstance_t = std::ptr::null_mut();
        check(unsafe {
            self.lib
                .nvmlGpuInstanceGetComputeInstanceById(instance.0, id, &mut compute)
        })?;
        Ok(NvmlComputeInstance(compute))
    }

    fn destroy_sub_instance(&self, sub_instance: &NvmlComputeInstance) -> Result<(), DriverError> {
        check(unsafe { self.lib.nvmlComputeInstanceDestroy(sub_instance.0) })
    }

    fn destroy_instance(&self, instance: &NvmlGpuInstance) -> Result<(), DriverError> {
        check(unsafe { self.lib.nvmlGpuInstanceDestroy(instance.0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(check(NVML_SUCCESS), Ok(()));
        assert_eq!(check(NVML_ERROR_NOT_FOUND), Err(DriverError::NotFound));
        assert_eq!(
            check(NVML_ERROR_INSUFFICIENT_RESOURCES),
            Err(DriverError::InsufficientResources)
        );
        assert_eq!(check(19).unwrap_err().code(), Some(19));
    }

    #[test]
    #[ignore = "Requires NVIDIA GPU with MIG mode enabled"]
    fn test_nvml_device_identity() {
        let driver = NvmlDriver::new(None).unwrap();
        let device = driver.device(&DeviceSelector::Index(0)).unwrap();
        let identity = driver.device_identity(&device).unwrap();
        assert!(identity.as_str().starts_with("GPU-"));
    }
}
