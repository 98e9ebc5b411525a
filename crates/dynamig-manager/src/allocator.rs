//! Partition allocator: creates a slice, reusing one a previous run already made

use dynamig_core::{
    DeviceIdentity, DeviceSelector, DriverError, MigError, MigResult, Operation, Placement,
    Profile, ProfileCatalog, Slice, SliceState,
};
use dynamig_driver::{CreateOutcome, DeviceDriver, SHARED_ENGINE_SLOT};
use tracing::{debug, info, warn};

/// Map a failed device lookup onto the error taxonomy
pub(crate) fn device_lookup_error(selector: &DeviceSelector, err: DriverError) -> MigError {
    match err {
        DriverError::NotFound => MigError::DeviceNotFound {
            device: selector.to_string(),
        },
        other => MigError::driver(Operation::DeviceLookup, selector.to_string(), other),
    }
}

/// Allocates GPU instance + compute instance pairs on one device
pub struct PartitionAllocator<'a, D: DeviceDriver> {
    driver: &'a D,
}

/// What a single allocation is about, for log fields and error context
struct Request<'r> {
    identity: &'r DeviceIdentity,
    profile_name: &'r str,
    profile: &'r Profile,
    placement: Placement,
}

impl Request<'_> {
    fn target(&self) -> String {
        format!(
            "profile {} at placement {} on {}",
            self.profile_name, self.placement, self.identity
        )
    }
}

impl<'a, D: DeviceDriver> PartitionAllocator<'a, D> {
    pub fn new(driver: &'a D) -> Self {
        Self { driver }
    }

    /// Resolve the device and profile by name, then allocate at `start`
    pub fn allocate_named(
        &self,
        selector: &DeviceSelector,
        catalog: &ProfileCatalog,
        profile_name: &str,
        start: u32,
    ) -> MigResult<Slice> {
        let profile = catalog.lookup(profile_name)?;
        let device = self
            .driver
            .device(selector)
            .map_err(|e| device_lookup_error(selector, e))?;
        self.allocate(
            &device,
            profile_name,
            profile,
            Placement::for_profile(profile, start),
        )
    }

    /// Allocate a slice of `profile` at `placement`.
    ///
    /// If the driver reports the profile's pool as exhausted, an existing GPU
    /// instance with the same template, the same placement and the same parent
    /// device is reused instead. A compute instance is then created inside the
    /// GPU instance, or the existing one is picked up when the driver reports
    /// the compute pool as exhausted.
    ///
    /// The placement must be exactly as wide as the profile's slot width.
    pub fn allocate(
        &self,
        device: &D::Device,
        profile_name: &str,
        profile: &Profile,
        placement: Placement,
    ) -> MigResult<Slice> {
        if placement.size != profile.slot_width {
            return Err(MigError::InvalidPlacement {
                profile: profile_name.to_string(),
                placement,
                slot_width: profile.slot_width,
            });
        }

        let identity = self
            .driver
            .device_identity(device)
            .map_err(|e| MigError::driver(Operation::DeviceIdentity, profile_name, e))?;
        let request = Request {
            identity: &identity,
            profile_name,
            profile,
            placement,
        };

        let outcome = self
            .driver
            .create_instance(device, profile.gi_template, placement);
        let (instance, recovered) = match outcome {
            CreateOutcome::Created(instance) => (instance, false),
            CreateOutcome::Exhausted => {
                debug!(
                    device = %identity,
                    profile = profile_name,
                    start = placement.start,
                    "GPU instance pool exhausted, scanning for an existing instance"
                );
                (self.reconcile_instance(device, &request)?, true)
            }
            CreateOutcome::Rejected(err) => {
                return Err(MigError::driver(
                    Operation::CreateInstance,
                    request.target(),
                    err,
                ));
            }
        };

        let gi = self.driver.instance_id(&instance).map_err(|e| {
            if !recovered {
                warn!(
                    device = %identity,
                    profile = profile_name,
                    start = placement.start,
                    size = placement.size,
                    error = %e,
                    "GPU instance created but its id could not be read"
                );
            }
            MigError::driver(Operation::InstanceInfo, request.target(), e)
        })?;

        info!(
            device = %identity,
            profile = profile_name,
            start = placement.start,
            size = placement.size,
            gi = gi,
            recovered = recovered,
            "GPU instance ready"
        );

        let state = self
            .attach_compute(&instance, gi, &request)
            .map_err(|e| e.incomplete(SliceState::GpuInstanceOnly { gi }))?;

        Ok(Slice {
            device: identity.clone(),
            profile_name: profile_name.to_string(),
            profile: *profile,
            placement,
            state,
            recovered,
        })
    }

    /// Find the GPU instance an earlier allocation left at this placement
    fn reconcile_instance(
        &self,
        device: &D::Device,
        request: &Request<'_>,
    ) -> MigResult<D::Instance> {
        let candidates = self
            .driver
            .list_instances(device, request.profile.gi_template)
            .map_err(|e| MigError::driver(Operation::ListInstances, request.target(), e))?;

        for candidate in candidates {
            let placement = self
                .driver
                .instance_placement(&candidate)
                .map_err(|e| MigError::driver(Operation::InstanceInfo, request.target(), e))?;
            let parent = self
                .driver
                .instance_parent(&candidate)
                .map_err(|e| MigError::driver(Operation::InstanceInfo, request.target(), e))?;

            debug!(
                parent = %parent,
                start = placement.start,
                size = placement.size,
                "Reconciliation candidate"
            );

            if placement == request.placement && parent == *request.identity {
                return Ok(candidate);
            }
        }

        Err(MigError::PartitionUnavailable {
            device: request.identity.to_string(),
            profile: request.profile_name.to_string(),
            placement: request.placement,
        })
    }

    /// Create the compute instance, or resolve the one already present
    fn attach_compute(
        &self,
        instance: &D::Instance,
        gi: u32,
        request: &Request<'_>,
    ) -> MigResult<SliceState> {
        let target = || format!("gi {} ({})", gi, request.target());

        let template = self
            .driver
            .sub_template_info(instance, request.profile.ci_template, SHARED_ENGINE_SLOT)
            .map_err(|e| MigError::driver(Operation::SubTemplateInfo, target(), e))?;

        let compute = match self.driver.create_sub_instance(instance, &template) {
            CreateOutcome::Created(compute) => compute,
            CreateOutcome::Exhausted => {
                let existing = self
                    .driver
                    .list_sub_instances(instance, &template)
                    .map_err(|e| MigError::driver(Operation::ListSubInstances, target(), e))?;
                match existing.into_iter().next() {
                    Some(compute) => compute,
                    None => {
                        warn!(
                            device = %request.identity,
                            profile = request.profile_name,
                            gi = gi,
                            "Compute pool exhausted and no compute instance of the profile exists"
                        );
                        return Ok(SliceState::GpuInstanceOnly { gi });
                    }
                }
            }
            CreateOutcome::Rejected(err) => {
                return Err(MigError::driver(Operation::CreateSubInstance, target(), err));
            }
        };

        let ci = self
            .driver
            .sub_instance_id(&compute)
            .map_err(|e| MigError::driver(Operation::SubInstanceLookup, target(), e))?;

        info!(device = %request.identity, gi = gi, ci = ci, "Compute instance ready");

        Ok(SliceState::Ready { gi, ci })
    }
}
