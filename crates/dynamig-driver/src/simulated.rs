//! In-memory simulated driver
//!
//! Models MIG-capable devices closely enough to exercise the partition
//! lifecycle without hardware: overlapping placements are rejected as
//! exhausted, a GPU instance with live compute instances cannot be destroyed,
//! and faults can be injected per operation.

use crate::traits::{CreateOutcome, DeviceDriver};
use dynamig_core::{DeviceIdentity, DeviceSelector, DriverError, Operation, Placement};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

// NVML status codes, reused so simulated errors read like real ones
const CODE_INVALID_ARGUMENT: u32 = 2;
const CODE_NOT_SUPPORTED: u32 = 3;
const CODE_IN_USE: u32 = 19;

/// Handle to a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDevice {
    index: usize,
}

/// Handle to a simulated GPU instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimInstance {
    device: usize,
    gi: u32,
}

/// Handle to a simulated compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSubInstance {
    device: usize,
    gi: u32,
    ci: u32,
}

/// Simulated compute profile info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimComputeProfile {
    pub id: u32,
    pub slice_count: u32,
}

#[derive(Debug)]
struct ComputeState {
    template: u32,
    slice_count: u32,
}

#[derive(Debug)]
struct InstanceState {
    template: u32,
    placement: Placement,
    parent: Option<DeviceIdentity>,
    computes: BTreeMap<u32, ComputeState>,
    next_ci: u32,
}

impl InstanceState {
    fn new(template: u32, placement: Placement) -> Self {
        Self {
            template,
            placement,
            parent: None,
            computes: BTreeMap::new(),
            next_ci: 0,
        }
    }

    fn used_slices(&self) -> u32 {
        self.computes.values().map(|c| c.slice_count).sum()
    }
}

#[derive(Debug)]
struct DeviceState {
    uuid: DeviceIdentity,
    name: String,
    slots: u32,
    mig_enabled: bool,
    instances: BTreeMap<u32, InstanceState>,
    next_gi: u32,
}

impl DeviceState {
    /// Whether slots `start..end` intersect a live instance
    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.instances.values().any(|gi| {
            let other_end = gi.placement.start.saturating_add(gi.placement.size);
            start < other_end && gi.placement.start < end
        })
    }

    fn insert(&mut self, instance: InstanceState) -> u32 {
        let id = self.next_gi;
        self.next_gi += 1;
        self.instances.insert(id, instance);
        id
    }
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    error: DriverError,
    /// `None` means the fault never expires
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<DeviceState>,
    faults: Vec<Fault>,
    calls: HashMap<Operation, usize>,
}

impl SimState {
    /// Count the call and return an injected fault, if one is armed
    fn enter(&mut self, operation: Operation) -> Result<(), DriverError> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let Some(pos) = self.faults.iter().position(|f| f.operation == operation) else {
            return Ok(());
        };
        let fault = &mut self.faults[pos];
        let error = fault.error.clone();
        let expired = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if expired {
            self.faults.remove(pos);
        }
        debug!(operation = %operation, error = %error, "Injected driver fault");
        Err(error)
    }

    fn device(&self, index: usize) -> Result<&DeviceState, DriverError> {
        self.devices.get(index).ok_or(DriverError::NotFound)
    }

    fn device_mut(&mut self, index: usize) -> Result<&mut DeviceState, DriverError> {
        self.devices.get_mut(index).ok_or(DriverError::NotFound)
    }

    fn instance(&self, handle: &SimInstance) -> Result<&InstanceState, DriverError> {
        self.device(handle.device)?
            .instances
            .get(&handle.gi)
            .ok_or(DriverError::NotFound)
    }

    fn instance_mut(&mut self, handle: &SimInstance) -> Result<&mut InstanceState, DriverError> {
        self.device_mut(handle.device)?
            .instances
            .get_mut(&handle.gi)
            .ok_or(DriverError::NotFound)
    }
}

/// In-memory driver with fault injection and call accounting
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    /// `count` MIG-enabled devices with `slots` placement slots each
    pub fn new(count: u32, slots: u32) -> Self {
        let driver = Self::default();
        for i in 0..count {
            driver.add_device(
                DeviceIdentity::new(format!("GPU-sim-{:04}", i)),
                "Simulated A100-SXM4-40GB",
                slots,
            );
        }
        driver
    }

    /// Add a MIG-enabled device; returns its index
    pub fn add_device(&self, uuid: DeviceIdentity, name: &str, slots: u32) -> u32 {
        let mut state = self.lock();
        state.devices.push(DeviceState {
            uuid,
            name: name.to_string(),
            slots,
            mig_enabled: true,
            instances: BTreeMap::new(),
            next_gi: 0,
        });
        (state.devices.len() - 1) as u32
    }

    pub fn set_mig_enabled(&self, index: u32, enabled: bool) {
        if let Some(device) = self.lock().devices.get_mut(index as usize) {
            device.mig_enabled = enabled;
        }
    }

    /// Place a GPU instance directly, as if an earlier process had created it
    pub fn seed_instance(&self, index: u32, gi_template: u32, placement: Placement) -> Option<u32> {
        let mut state = self.lock();
        let device = state.devices.get_mut(index as usize)?;
        Some(device.insert(InstanceState::new(gi_template, placement)))
    }

    /// Like `seed_instance`, but the instance reports a different parent device
    pub fn seed_instance_with_parent(
        &self,
        index: u32,
        gi_template: u32,
        placement: Placement,
        parent: DeviceIdentity,
    ) -> Option<u32> {
        let mut state = self.lock();
        let device = state.devices.get_mut(index as usize)?;
        let mut instance = InstanceState::new(gi_template, placement);
        instance.parent = Some(parent);
        Some(device.insert(instance))
    }

    /// Place a compute instance occupying the whole GPU instance
    pub fn seed_sub_instance(&self, index: u32, gi: u32, ci_template: u32) -> Option<u32> {
        let mut state = self.lock();
        let instance = state
            .devices
            .get_mut(index as usize)?
            .instances
            .get_mut(&gi)?;
        let id = instance.next_ci;
        instance.next_ci += 1;
        let slice_count = instance.placement.size;
        instance.computes.insert(
            id,
            ComputeState {
                template: ci_template,
                slice_count,
            },
        );
        Some(id)
    }

    /// Fail the next `times` calls of `operation` with `error`
    pub fn fail_next(&self, operation: Operation, error: DriverError, times: usize) {
        if times == 0 {
            return;
        }
        self.lock().faults.push(Fault {
            operation,
            error,
            remaining: Some(times),
        });
    }

    /// Fail every call of `operation` with `error`
    pub fn fail_always(&self, operation: Operation, error: DriverError) {
        self.lock().faults.push(Fault {
            operation,
            error,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of calls made to `operation`, including failed ones
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Number of live GPU instances on a device
    pub fn instance_count(&self, index: u32) -> usize {
        self.lock()
            .devices
            .get(index as usize)
            .map(|d| d.instances.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceDriver for SimulatedDriver {
    type Device = SimDevice;
    type Instance = SimInstance;
    type SubInstance = SimSubInstance;
    type SubTemplate = SimComputeProfile;

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> Result<u32, DriverError> {
        Ok(self.lock().devices.len() as u32)
    }

    fn device(&self, selector: &DeviceSelector) -> Result<SimDevice, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::DeviceLookup)?;
        let index = match selector {
            DeviceSelector::Index(index) => {
                let index = *index as usize;
                state.device(index)?;
                index
            }
            DeviceSelector::Uuid(uuid) => state
                .devices
                .iter()
                .position(|d| d.uuid.as_str() == uuid)
                .ok_or(DriverError::NotFound)?,
        };
        Ok(SimDevice { index })
    }

    fn device_identity(&self, device: &SimDevice) -> Result<DeviceIdentity, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::DeviceIdentity)?;
        Ok(state.device(device.index)?.uuid.clone())
    }

    fn device_name(&self, device: &SimDevice) -> Result<String, DriverError> {
        Ok(self.lock().device(device.index)?.name.clone())
    }

    fn mig_enabled(&self, device: &SimDevice) -> Result<bool, DriverError> {
        Ok(self.lock().device(device.index)?.mig_enabled)
    }

    fn create_instance(
        &self,
        device: &SimDevice,
        gi_template: u32,
        placement: Placement,
    ) -> CreateOutcome<SimInstance> {
        let mut state = self.lock();
        let result = state.enter(Operation::CreateInstance).and_then(|_| {
            let target = state.device_mut(device.index)?;
            if !target.mig_enabled {
                return Err(DriverError::rejected(CODE_NOT_SUPPORTED, "MIG mode disabled"));
            }
            let end = match placement.start.checked_add(placement.size) {
                Some(end) if placement.size > 0 && end <= target.slots => end,
                _ => {
                    return Err(DriverError::rejected(
                        CODE_INVALID_ARGUMENT,
                        format!("placement {} outside {} slots", placement, target.slots),
                    ));
                }
            };
            if target.overlaps(placement.start, end) {
                return Err(DriverError::InsufficientResources);
            }
            let gi = target.insert(InstanceState::new(gi_template, placement));
            Ok(SimInstance {
                device: device.index,
                gi,
            })
        });
        CreateOutcome::from_result(result)
    }

    fn list_instances(
        &self,
        device: &SimDevice,
        gi_template: u32,
    ) -> Result<Vec<SimInstance>, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::ListInstances)?;
        Ok(state
            .device(device.index)?
            .instances
            .iter()
            .filter(|(_, gi)| gi.template == gi_template)
            .map(|(id, _)| SimInstance {
                device: device.index,
                gi: *id,
            })
            .collect())
    }

    fn instance_id(&self, instance: &SimInstance) -> Result<u32, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::InstanceInfo)?;
        state.instance(instance)?;
        Ok(instance.gi)
    }

    fn instance_placement(&self, instance: &SimInstance) -> Result<Placement, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::InstanceInfo)?;
        Ok(state.instance(instance)?.placement)
    }

    fn instance_parent(&self, instance: &SimInstance) -> Result<DeviceIdentity, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::InstanceInfo)?;
        let gi = state.instance(instance)?;
        match &gi.parent {
            Some(parent) => Ok(parent.clone()),
            None => Ok(state.device(instance.device)?.uuid.clone()),
        }
    }

    fn instance_by_id(&self, device: &SimDevice, id: u32) -> Result<SimInstance, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::InstanceLookup)?;
        let handle = SimInstance {
            device: device.index,
            gi: id,
        };
        state.instance(&handle)?;
        Ok(handle)
    }

    fn sub_template_info(
        &self,
        instance: &SimInstance,
        ci_template: u32,
        engine_slot: u32,
    ) -> Result<SimComputeProfile, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::SubTemplateInfo)?;
        if engine_slot != crate::SHARED_ENGINE_SLOT {
            return Err(DriverError::rejected(
                CODE_NOT_SUPPORTED,
                format!("engine slot {} not supported", engine_slot),
            ));
        }
        let gi = state.instance(instance)?;
        Ok(SimComputeProfile {
            id: ci_template,
            slice_count: gi.placement.size,
        })
    }

    fn create_sub_instance(
        &self,
        instance: &SimInstance,
        template: &SimComputeProfile,
    ) -> CreateOutcome<SimSubInstance> {
        let mut state = self.lock();
        let result = state.enter(Operation::CreateSubInstance).and_then(|_| {
            let gi = state.instance_mut(instance)?;
            if gi.used_slices() + template.slice_count > gi.placement.size {
                return Err(DriverError::InsufficientResources);
            }
            let ci = gi.next_ci;
            gi.next_ci += 1;
            gi.computes.insert(
                ci,
                ComputeState {
                    template: template.id,
                    slice_count: template.slice_count,
                },
            );
            Ok(SimSubInstance {
                device: instance.device,
                gi: instance.gi,
                ci,
            })
        });
        CreateOutcome::from_result(result)
    }

    fn list_sub_instances(
        &self,
        instance: &SimInstance,
        template: &SimComputeProfile,
    ) -> Result<Vec<SimSubInstance>, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::ListSubInstances)?;
        Ok(state
            .instance(instance)?
            .computes
            .iter()
            .filter(|(_, ci)| ci.template == template.id)
            .map(|(id, _)| SimSubInstance {
                device: instance.device,
                gi: instance.gi,
                ci: *id,
            })
            .collect())
    }

    fn sub_instance_id(&self, sub_instance: &SimSubInstance) -> Result<u32, DriverError> {
        Ok(sub_instance.ci)
    }

    fn sub_instance_by_id(
        &self,
        instance: &SimInstance,
        id: u32,
    ) -> Result<SimSubInstance, DriverError> {
        let mut state = self.lock();
        state.enter(Operation::SubInstanceLookup)?;
        if !state.instance(instance)?.computes.contains_key(&id) {
            return Err(DriverError::NotFound);
        }
        Ok(SimSubInstance {
            device: instance.device,
            gi: instance.gi,
            ci: id,
        })
    }

    fn destroy_sub_instance(&self, sub_instance: &SimSubInstance) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.enter(Operation::DestroySubInstance)?;
        let gi = state.instance_mut(&SimInstance {
            device: sub_instance.device,
            gi: sub_instance.gi,
        })?;
        gi.computes
            .remove(&sub_instance.ci)
            .map(|_| ())
            .ok_or(DriverError::NotFound)
    }

    fn destroy_instance(&self, instance: &SimInstance) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.enter(Operation::DestroyInstance)?;
        if !state.instance(instance)?.computes.is_empty() {
            return Err(DriverError::rejected(
                CODE_IN_USE,
                "GPU instance still has compute instances",
            ));
        }
        state.device_mut(instance.device)?.instances.remove(&instance.gi);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu0(driver: &SimulatedDriver) -> SimDevice {
        driver.device(&DeviceSelector::Index(0)).unwrap()
    }

    #[test]
    fn test_device_lookup() {
        let driver = SimulatedDriver::new(2, 8);
        assert_eq!(driver.device_count().unwrap(), 2);

        let by_uuid = driver
            .device(&DeviceSelector::Uuid("GPU-sim-0001".to_string()))
            .unwrap();
        assert_eq!(
            driver.device_identity(&by_uuid).unwrap().as_str(),
            "GPU-sim-0001"
        );
        assert_eq!(
            driver.device(&DeviceSelector::Index(5)).unwrap_err(),
            DriverError::NotFound
        );
    }

    #[test]
    fn test_overlapping_placement_is_exhausted() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);

        assert!(matches!(
            driver.create_instance(&device, 2, Placement::new(0, 4)),
            CreateOutcome::Created(_)
        ));
        assert!(matches!(
            driver.create_instance(&device, 0, Placement::new(3, 1)),
            CreateOutcome::Exhausted
        ));
        assert!(matches!(
            driver.create_instance(&device, 0, Placement::new(4, 1)),
            CreateOutcome::Created(_)
        ));
    }

    #[test]
    fn test_out_of_range_placement_rejected() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);

        match driver.create_instance(&device, 4, Placement::new(4, 8)) {
            CreateOutcome::Rejected(err) => assert_eq!(err.code(), Some(CODE_INVALID_ARGUMENT)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_placement_end_overflow_rejected() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);

        match driver.create_instance(&device, 0, Placement::new(u32::MAX, 1)) {
            CreateOutcome::Rejected(err) => assert_eq!(err.code(), Some(CODE_INVALID_ARGUMENT)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(driver.instance_count(0), 0);
    }

    #[test]
    fn test_overlap_check_tolerates_seeded_wraparound() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);
        driver
            .seed_instance(0, 0, Placement::new(u32::MAX - 1, 4))
            .unwrap();

        assert!(matches!(
            driver.create_instance(&device, 0, Placement::new(7, 1)),
            CreateOutcome::Created(_)
        ));
    }

    #[test]
    fn test_gpu_instance_with_compute_cannot_be_destroyed() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);
        let gi = driver.seed_instance(0, 0, Placement::new(0, 1)).unwrap();
        driver.seed_sub_instance(0, gi, 0).unwrap();

        let handle = driver.instance_by_id(&device, gi).unwrap();
        let err = driver.destroy_instance(&handle).unwrap_err();
        assert_eq!(err.code(), Some(CODE_IN_USE));
        assert_eq!(driver.instance_count(0), 1);
    }

    #[test]
    fn test_compute_capacity() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);
        let gi = match driver.create_instance(&device, 1, Placement::new(2, 2)) {
            CreateOutcome::Created(gi) => gi,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let profile = driver.sub_template_info(&gi, 1, 0).unwrap();

        assert!(matches!(
            driver.create_sub_instance(&gi, &profile),
            CreateOutcome::Created(_)
        ));
        assert!(matches!(
            driver.create_sub_instance(&gi, &profile),
            CreateOutcome::Exhausted
        ));
        assert_eq!(driver.list_sub_instances(&gi, &profile).unwrap().len(), 1);
    }

    #[test]
    fn test_fault_injection_expires() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);
        driver.fail_next(Operation::ListInstances, DriverError::rejected(999, "boom"), 1);

        assert!(driver.list_instances(&device, 0).is_err());
        assert!(driver.list_instances(&device, 0).is_ok());
        assert_eq!(driver.calls(Operation::ListInstances), 2);
    }

    #[test]
    fn test_persistent_fault() {
        let driver = SimulatedDriver::new(1, 8);
        let device = gpu0(&driver);
        driver.fail_always(Operation::CreateInstance, DriverError::InsufficientResources);

        for start in 0..3 {
            assert!(matches!(
                driver.create_instance(&device, 0, Placement::new(start, 1)),
                CreateOutcome::Exhausted
            ));
        }
        driver.clear_faults();
        assert!(matches!(
            driver.create_instance(&device, 0, Placement::new(0, 1)),
            CreateOutcome::Created(_)
        ));
    }
}
