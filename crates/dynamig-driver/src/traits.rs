//! Device capability trait definitions

use dynamig_core::{DeviceIdentity, DeviceSelector, DriverError, Placement};

/// Engine placement used for compute profile lookups (single shared engine group)
pub const SHARED_ENGINE_SLOT: u32 = 0;

/// Result of a driver create call
#[derive(Debug)]
pub enum CreateOutcome<H> {
    /// A new handle was created
    Created(H),
    /// The template's resource pool is fully subscribed
    Exhausted,
    /// Any other failure
    Rejected(DriverError),
}

impl<H> CreateOutcome<H> {
    /// Classify a raw driver result
    pub fn from_result(result: Result<H, DriverError>) -> Self {
        match result {
            Ok(handle) => CreateOutcome::Created(handle),
            Err(DriverError::InsufficientResources) => CreateOutcome::Exhausted,
            Err(err) => CreateOutcome::Rejected(err),
        }
    }
}

/// Capability surface of a partitionable accelerator driver.
///
/// Every call is synchronous and may block on driver I/O. Handles are only
/// valid for the driver instance that produced them.
pub trait DeviceDriver {
    /// Physical device handle
    type Device;
    /// GPU instance handle
    type Instance;
    /// Compute instance handle
    type SubInstance;
    /// Compute profile info, as needed to create a compute instance
    type SubTemplate;

    /// Backend name
    fn name(&self) -> &'static str;

    /// Number of physical devices
    fn device_count(&self) -> Result<u32, DriverError>;

    /// Resolve a device by index or UUID
    fn device(&self, selector: &DeviceSelector) -> Result<Self::Device, DriverError>;

    fn device_identity(&self, device: &Self::Device) -> Result<DeviceIdentity, DriverError>;

    fn device_name(&self, device: &Self::Device) -> Result<String, DriverError>;

    /// Whether MIG mode is currently enabled
    fn mig_enabled(&self, device: &Self::Device) -> Result<bool, DriverError>;

    /// Create a GPU instance from a template at a fixed placement
    fn create_instance(
        &self,
        device: &Self::Device,
        gi_template: u32,
        placement: Placement,
    ) -> CreateOutcome<Self::Instance>;

    /// Live GPU instances created from a template
    fn list_instances(
        &self,
        device: &Self::Device,
        gi_template: u32,
    ) -> Result<Vec<Self::Instance>, DriverError>;

    fn instance_id(&self, instance: &Self::Instance) -> Result<u32, DriverError>;

    fn instance_placement(&self, instance: &Self::Instance) -> Result<Placement, DriverError>;

    /// Identity of the device the instance belongs to
    fn instance_parent(&self, instance: &Self::Instance) -> Result<DeviceIdentity, DriverError>;

    fn instance_by_id(&self, device: &Self::Device, id: u32)
        -> Result<Self::Instance, DriverError>;

    /// Compute profile info for a template within a GPU instance
    fn sub_template_info(
        &self,
        instance: &Self::Instance,
        ci_template: u32,
        engine_slot: u32,
    ) -> Result<Self::SubTemplate, DriverError>;

    fn create_sub_instance(
        &self,
        instance: &Self::Instance,
        template: &Self::SubTemplate,
    ) -> CreateOutcome<Self::SubInstance>;

    /// Live compute instances of a GPU instance created from a compute profile
    fn list_sub_instances(
        &self,
        instance: &Self::Instance,
        template: &Self::SubTemplate,
    ) -> Result<Vec<Self::SubInstance>, DriverError>;

    fn sub_instance_id(&self, sub_instance: &Self::SubInstance) -> Result<u32, DriverError>;

    fn sub_instance_by_id(
        &self,
        instance: &Self::Instance,
        id: u32,
    ) -> Result<Self::SubInstance, DriverError>;

    fn destroy_sub_instance(&self, sub_instance: &Self::SubInstance) -> Result<(), DriverError>;

    fn destroy_instance(&self, instance: &Self::Instance) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(
            CreateOutcome::from_result(Ok::<u32, _>(4)),
            CreateOutcome::Created(4)
        ));
        assert!(matches!(
            CreateOutcome::<u32>::from_result(Err(DriverError::InsufficientResources)),
            CreateOutcome::Exhausted
        ));
        assert!(matches!(
            CreateOutcome::<u32>::from_result(Err(DriverError::NotFound)),
            CreateOutcome::Rejected(DriverError::NotFound)
        ));
    }
}
