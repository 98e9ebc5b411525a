//! Partition reclaimer: tears a slice down, compute instance first

use crate::allocator::device_lookup_error;
use dynamig_core::{DeviceSelector, DriverError, MigError, MigResult, Operation, SliceState};
use dynamig_driver::DeviceDriver;
use tracing::{info, warn};

fn instance_lookup_error(what: String, operation: Operation, err: DriverError) -> MigError {
    match err {
        DriverError::NotFound => MigError::InstanceNotFound { instance: what },
        other => MigError::driver(operation, what, other),
    }
}

/// Destroys slices created by the allocator
pub struct PartitionReclaimer<'a, D: DeviceDriver> {
    driver: &'a D,
}

impl<'a, D: DeviceDriver> PartitionReclaimer<'a, D> {
    pub fn new(driver: &'a D) -> Self {
        Self { driver }
    }

    /// Destroy compute instance `ci` and then its GPU instance `gi`.
    ///
    /// The GPU instance is never touched unless the compute instance was
    /// destroyed. If the GPU instance cannot be destroyed afterwards the error
    /// carries `SliceState::ComputeDestroyed` and nothing is retried.
    pub fn reclaim(&self, selector: &DeviceSelector, gi: u32, ci: u32) -> MigResult<()> {
        let device = self
            .driver
            .device(selector)
            .map_err(|e| device_lookup_error(selector, e))?;

        let gi_name = || format!("gi {} on {}", gi, selector);
        let ci_name = || format!("ci {} in gi {} on {}", ci, gi, selector);

        let instance = self
            .driver
            .instance_by_id(&device, gi)
            .map_err(|e| instance_lookup_error(gi_name(), Operation::InstanceLookup, e))?;
        let compute = self
            .driver
            .sub_instance_by_id(&instance, ci)
            .map_err(|e| instance_lookup_error(ci_name(), Operation::SubInstanceLookup, e))?;

        self.driver
            .destroy_sub_instance(&compute)
            .map_err(|e| MigError::driver(Operation::DestroySubInstance, ci_name(), e))?;
        info!(device = %selector, gi = gi, ci = ci, "Compute instance destroyed");

        self.driver.destroy_instance(&instance).map_err(|e| {
            warn!(
                device = %selector,
                gi = gi,
                error = %e,
                "GPU instance left without compute instance"
            );
            MigError::driver(Operation::DestroyInstance, gi_name(), e)
                .incomplete(SliceState::ComputeDestroyed { gi })
        })?;
        info!(device = %selector, gi = gi, "GPU instance destroyed");

        Ok(())
    }

    /// Destroy a GPU instance that has no compute instance left, such as
    /// one stuck after a partial reclaim
    pub fn reclaim_instance(&self, selector: &DeviceSelector, gi: u32) -> MigResult<()> {
        let device = self
            .driver
            .device(selector)
            .map_err(|e| device_lookup_error(selector, e))?;
        let gi_name = || format!("gi {} on {}", gi, selector);

        let instance = self
            .driver
            .instance_by_id(&device, gi)
            .map_err(|e| instance_lookup_error(gi_name(), Operation::InstanceLookup, e))?;
        self.driver
            .destroy_instance(&instance)
            .map_err(|e| MigError::driver(Operation::DestroyInstance, gi_name(), e))?;
        info!(device = %selector, gi = gi, "GPU instance destroyed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamig_core::{ErrorKind, Placement};
    use dynamig_driver::SimulatedDriver;

    fn seeded() -> (SimulatedDriver, u32, u32) {
        let driver = SimulatedDriver::new(1, 8);
        let gi = driver.seed_instance(0, 0, Placement::new(0, 1)).unwrap();
        let ci = driver.seed_sub_instance(0, gi, 0).unwrap();
        (driver, gi, ci)
    }

    #[test]
    fn test_reclaim_destroys_both() {
        let (driver, gi, ci) = seeded();
        let reclaimer = PartitionReclaimer::new(&driver);

        reclaimer.reclaim(&DeviceSelector::Index(0), gi, ci).unwrap();
        assert_eq!(driver.instance_count(0), 0);
    }

    #[test]
    fn test_reclaim_unknown_device() {
        let (driver, gi, ci) = seeded();
        let reclaimer = PartitionReclaimer::new(&driver);

        let err = reclaimer
            .reclaim(&DeviceSelector::Uuid("GPU-missing".to_string()), gi, ci)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert!(err.to_string().contains("GPU-missing"));
    }

    #[test]
    fn test_reclaim_unknown_instances() {
        let (driver, gi, ci) = seeded();
        let reclaimer = PartitionReclaimer::new(&driver);

        let err = reclaimer
            .reclaim(&DeviceSelector::Index(0), gi + 1, ci)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);

        let err = reclaimer
            .reclaim(&DeviceSelector::Index(0), gi, ci + 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
        assert!(err.to_string().contains(&format!("ci {}", ci + 1)));
        assert_eq!(driver.calls(Operation::DestroySubInstance), 0);
    }

    #[test]
    fn test_compute_destroy_out_of_resources_is_rejection() {
        let (driver, gi, ci) = seeded();
        driver.fail_next(
            Operation::DestroySubInstance,
            DriverError::InsufficientResources,
            1,
        );
        let reclaimer = PartitionReclaimer::new(&driver);

        let err = reclaimer
            .reclaim(&DeviceSelector::Index(0), gi, ci)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverRejected);
        assert_eq!(err.slice_state(), None);
        assert_eq!(driver.calls(Operation::DestroyInstance), 0);
    }

    #[test]
    fn test_gpu_instance_destroy_failure_reports_partial_state() {
        let (driver, gi, ci) = seeded();
        driver.fail_next(
            Operation::DestroyInstance,
            DriverError::rejected(19, "in use"),
            1,
        );
        let reclaimer = PartitionReclaimer::new(&driver);

        let err = reclaimer
            .reclaim(&DeviceSelector::Index(0), gi, ci)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverRejected);
        assert_eq!(err.slice_state(), Some(SliceState::ComputeDestroyed { gi }));
        assert_eq!(driver.calls(Operation::DestroyInstance), 1);

        // The stuck GPU instance can be cleaned up on its own
        reclaimer
            .reclaim_instance(&DeviceSelector::Index(0), gi)
            .unwrap();
        assert_eq!(driver.instance_count(0), 0);
    }

    #[test]
    fn test_reclaim_instance_refuses_live_compute() {
        let (driver, gi, _) = seeded();
        let reclaimer = PartitionReclaimer::new(&driver);

        let err = reclaimer
            .reclaim_instance(&DeviceSelector::Index(0), gi)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverRejected);
        assert_eq!(driver.instance_count(0), 1);
    }
}
